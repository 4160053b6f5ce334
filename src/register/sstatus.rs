//! 监督状态寄存器 (sstatus) 操作模块

use core::arch::asm;

const SIE: usize = 1 << 1;  // supervisor interrupt enable
const SPIE: usize = 1 << 5; // supervisor previous interrupt enable
const SPP: usize = 1 << 8;  // previous mode, is from supervisor?

#[inline]
pub fn read() -> usize {
    let ret: usize;
    unsafe { asm!("csrr {}, sstatus", out(reg) ret); }
    ret
}

#[inline]
pub fn write(x: usize) {
    unsafe { asm!("csrw sstatus, {}", in(reg) x); }
}

/// 打开监督模式全局中断 (SIE)。
/// 各中断源还需在 sie 寄存器中单独使能，且已通过 mideleg 下放。
#[inline]
pub fn intr_on() {
    write(read() | SIE);
}

/// 关闭监督模式全局中断 (SIE)
#[inline]
pub fn intr_off() {
    write(read() & !SIE);
}

/// 全局中断当前是否打开
#[inline]
pub fn intr_get() -> bool {
    let x = read();
    (x & SIE) != 0
}

/// 本次陷阱是否来自监督模式（SPP 位）
#[inline]
pub fn is_from_supervisor() -> bool {
    (read() & SPP) != 0
}

/// 本次陷阱是否来自用户模式（SPP 位）
#[inline]
pub fn is_from_user() -> bool {
    (read() & SPP) == 0
}

/// 为返回用户空间准备 sstatus：
/// 清除 SPP 使 sret 落入用户模式，置位 SPIE 使 sret 后重新打开中断。
#[inline]
pub fn user_ret_prepare() {
    let mut x = read();
    x &= !SPP;
    x |= SPIE;
    write(x);
}
