//! CLINT（核心本地中断器）操作模块
//!
//! 只用到定时器相关的两个寄存器：
//! - `mtime`：全局 64 位计时器，所有 hart 共享
//! - `mtimecmp`：每个 hart 独立的比较寄存器，mtime >= mtimecmp 时触发
//!   该 hart 的机器模式定时器中断

use core::ptr;
use core::convert::Into;

use crate::consts::{CLINT_MTIME, CLINT_MTIMECMP};

#[inline]
unsafe fn read_mtime() -> u64 {
    ptr::read_volatile(Into::<usize>::into(CLINT_MTIME) as *const u64)
}

#[inline]
unsafe fn write_mtimecmp(mhartid: usize, value: u64) {
    let offset = Into::<usize>::into(CLINT_MTIMECMP) + 8 * mhartid;
    ptr::write_volatile(offset as *mut u64, value);
}

/// 把 hart 的下一次定时器中断安排在 interval 个时钟周期之后
pub unsafe fn add_mtimecmp(mhartid: usize, interval: u64) {
    let value = read_mtime();
    write_mtimecmp(mhartid, value + interval);
}
