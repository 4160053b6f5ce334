//! 文件系统边界
//!
//! 磁盘上的文件系统（布局、缓冲区缓存、日志、路径解析）属于
//! 外部协作组件，进程核心只消费它的一小圈接口：文件句柄的
//! dup/close/读写、cwd 的 inode 句柄，以及第一个进程首次返回
//! 用户态时的挂载回调。这里就是那圈接口。

use alloc::sync::Arc;

use crate::consts::driver::{CONSOLE, NDEV};
use crate::consts::fs::ROOTDEV;
use crate::driver::DEVICES;
use crate::mm::Address;
use crate::rwlock::RwLock;

/// 根文件系统的挂载状态。
/// 写一次（挂载），之后全是读，放在读写锁后面。
static MOUNT: RwLock<MountState> = RwLock::new(
    MountState { dev: 0, ready: false },
    "fs",
);

struct MountState {
    dev: u32,
    ready: bool,
}

/// 挂载根文件系统。
///
/// 由第一个进程的首次 fork_ret 调用（挂载可能 sleep，
/// 不能放在 rust_main 里）。磁盘初始化本身在外部实现里，
/// 这里记录根设备并标记就绪。
///
/// # Panics
/// 重复挂载 panic。
pub fn init(dev: u32) {
    let mut mount = MOUNT.write();
    if mount.ready {
        panic!("fs: init twice");
    }
    mount.dev = dev;
    mount.ready = true;
    drop(mount);
    println!("fs: root device {} mounted", dev);
}

/// 根目录的 inode 号
const ROOTINO: u32 = 1;

/// 磁盘 inode 的句柄。
/// 克隆即 dup，丢弃即 put；落盘动作在外部文件系统实现里。
#[derive(Clone, Debug)]
pub struct Inode {
    pub dev: u32,
    pub inum: u32,
}

/// 取根目录的 inode，userinit 给第一个进程当 cwd。
///
/// 句柄是惰性的：userinit 发生在第一个进程真正跑起来、
/// fork_ret 挂载文件系统之前，此时按默认根设备发放即可，
/// 实际的磁盘访问都在挂载之后。
pub fn root_inode() -> Inode {
    let mount = MOUNT.read();
    let dev = if mount.ready { mount.dev } else { ROOTDEV };
    Inode { dev, inum: ROOTINO }
}

/// 打开的文件。
///
/// 进程的文件表存 `Arc<File>`：fork 里的 dup 是 Arc 克隆，
/// close 是把 Arc 从表里拿掉，最后一个引用消失时文件真正关闭。
#[derive(Debug)]
pub struct File {
    kind: FileKind,
    readable: bool,
    writable: bool,
}

#[derive(Debug)]
enum FileKind {
    /// 设备文件，major 是设备开关表的下标
    Device { major: usize },
}

impl File {
    /// 打开控制台设备。
    /// userinit 用它填第一个进程的 0/1/2 号描述符。
    pub fn open_console() -> Result<Arc<File>, ()> {
        Arc::try_new(File {
            kind: FileKind::Device { major: CONSOLE },
            readable: true,
            writable: true,
        }).map_err(|_| ())
    }

    /// 读 count 字节到 dst，返回实际读到的字节数
    pub fn read(&self, dst: Address, count: u32) -> Result<u32, ()> {
        if !self.readable {
            return Err(())
        }
        match self.kind {
            FileKind::Device { major } => {
                if major >= NDEV {
                    return Err(())
                }
                let dev = DEVICES[major].as_ref().ok_or(())?;
                (dev.read)(dst, count)
            }
        }
    }

    /// 从 src 写出 count 字节，返回实际写出的字节数
    pub fn write(&self, src: Address, count: u32) -> Result<u32, ()> {
        if !self.writable {
            return Err(())
        }
        match self.kind {
            FileKind::Device { major } => {
                if major >= NDEV {
                    return Err(())
                }
                let dev = DEVICES[major].as_ref().ok_or(())?;
                (dev.write)(src, count)
            }
        }
    }
}
