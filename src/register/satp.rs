//! 监督地址转换与保护寄存器 (satp) 操作模块

use core::arch::asm;

#[inline]
pub fn read() -> usize {
    let ret;
    unsafe {
        asm!("csrr {}, satp", out(reg) ret);
    }
    ret
}

/// 写入 satp。写入后由调用者执行 sfence.vma 冲刷 TLB。
#[inline]
pub fn write(satp: usize) {
    unsafe {
        asm!("csrw satp, {}", in(reg) satp);
    }
}
