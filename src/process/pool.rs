//! 待回收进程池
//!
//! freeproc 把已经掏空资源的进程记录推到这里，而不是立刻还给
//! 伙伴分配器：别的 hart 可能还经 claim 持着指向记录的裸指针
//! （watching > 0）。等某次 drain 观察到 watching 归零，记录才
//! 真正释放。池子的存在解开了一个死结——调度器不能为了保住指针
//! 一直押着注册表锁，又不能在持进程锁切换上下文时再去碰外部锁。

use alloc::boxed::Box;
use core::ptr;
use core::sync::atomic::Ordering;

use crate::consts::NCPU;
use crate::spinlock::SpinLock;

use super::proc::Proc;

/// 全局待回收池
pub static FREE_PROC_POOL: FreeProcPool = FreeProcPool::new();

/// 每个 hart 最多让两条记录滞留在回收路上
/// （一条自己正在释放的，一条 claim 到一半的），容量取 2*NCPU。
const POOL_CAPACITY: usize = NCPU * 2;

pub struct FreeProcPool(SpinLock<PoolInner>);

struct PoolInner {
    freed: [*mut Proc; POOL_CAPACITY],
    in_pool: usize,
}

unsafe impl Send for PoolInner {}

impl FreeProcPool {
    const fn new() -> Self {
        Self(SpinLock::new(
            PoolInner {
                freed: [ptr::null_mut(); POOL_CAPACITY],
                in_pool: 0,
            },
            "pool lock",
        ))
    }

    /// 把一条已掏空的记录放进池子。
    /// 放之前先顺手 drain 一轮腾位置。
    ///
    /// # Panics
    /// 池满（容量不变式被打破）时 panic。
    ///
    /// # 安全性
    /// `p` 必须是伙伴分配器分出的进程记录，且调用后不再被使用方
    /// 主动访问（claim 过的观察者除外，由 watching 保护）。
    pub unsafe fn push(&self, p: *mut Proc) {
        let mut inner = self.0.lock();
        Self::drain_inner(&mut inner);
        for slot in inner.freed.iter_mut() {
            if slot.is_null() {
                *slot = p;
                inner.in_pool += 1;
                return;
            }
        }
        panic!("push to free pool failed");
    }

    /// 释放池中所有 watching 已归零的记录。
    /// 调度器每 1000 圈调用一次。
    pub fn drain(&self) {
        let mut inner = self.0.lock();
        Self::drain_inner(&mut inner);
    }

    fn drain_inner(inner: &mut PoolInner) {
        if inner.in_pool == 0 {
            return;
        }
        for slot in inner.freed.iter_mut() {
            let p = *slot;
            if !p.is_null() {
                if unsafe { (*p).watching.load(Ordering::SeqCst) } == 0 {
                    // 最后一个观察者已经走了，记录交还伙伴分配器
                    drop(unsafe { Box::from_raw(p) });
                    *slot = ptr::null_mut();
                    inner.in_pool -= 1;
                }
            }
        }
    }

    /// 打印池中滞留的记录，procdump 用
    pub fn dump(&self) {
        println!("free pool");
        let inner = self.0.lock();
        for slot in inner.freed.iter() {
            let p = *slot;
            if !p.is_null() {
                let (pid, watching) = unsafe {
                    ((*p).excl.lock().pid, (*p).watching.load(Ordering::SeqCst))
                };
                println!("pid {} watching {}", pid, watching);
            }
        }
        println!();
    }
}
