//! 设备驱动模块
//!
//! 内核核心只带一个轮询输出的控制台；
//! 中断驱动的串口收发与磁盘属于外部协作组件。

use core::sync::atomic::AtomicBool;

use crate::consts::driver::NDEV;
use crate::mm::Address;

pub mod console;

/// 是否有 hart 已经 panic。
/// 置位后输出不再抢锁，避免把诊断信息憋死在锁后面。
pub(crate) static PANICKED: AtomicBool = AtomicBool::new(false);

/// 设备开关表，下标是主设备号
pub static DEVICES: [Option<Device>; NDEV] = [
    /* 0 */   None,
    /* 1 */   Some(Device { read: console::read, write: console::write }),
    /* 2 */   None,
    /* 3 */   None,
    /* 4 */   None,
    /* 5 */   None,
    /* 6 */   None,
    /* 7 */   None,
    /* 8 */   None,
    /* 9 */   None,
];

pub struct Device {
    /// 从设备读 count 字节到 [Address]
    pub read: fn(Address, u32) -> Result<u32, ()>,
    /// 把 [Address] 起的 count 字节写到设备
    pub write: fn(Address, u32) -> Result<u32, ()>,
}
