//! 睡眠锁模块
//! 基于进程休眠/唤醒机制的同步原语，适用于可能长时间持有的锁（如 I/O 等待）。
//! 锁被占用时，尝试获取的进程进入休眠而不是忙等待。

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut, Drop};

use crate::process::{CPU_MANAGER, PROC_MANAGER};
use crate::spinlock::SpinLock;

/// 睡眠锁。
///
/// # 字段说明
/// - `lock`: 内部自旋锁，保护 `locked` 状态；
/// - `locked`: 锁是否被占用；
/// - `name`: 锁名，调试用；
/// - `data`: 被保护的数据。
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: Cell<bool>,
    name: &'static str,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: Cell::new(false),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁，可能阻塞当前进程。
    ///
    /// # 流程解释
    /// 1. 先取内部自旋锁保护 `locked`；
    /// 2. 若已被占用，以 `locked` 的地址为通道休眠，醒来后重取自旋锁再判断；
    /// 3. 占到之后置位 `locked`，释放自旋锁并返回守卫。
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.lock.lock();

        while self.locked.get() {
            unsafe {
                CPU_MANAGER.my_proc().sleep(self.locked.as_ptr() as usize, guard);
            }
            guard = self.lock.lock();
        }
        self.locked.set(true);
        drop(guard);

        SleepLockGuard {
            lock: &self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 释放锁并唤醒等待者，由守卫的 `Drop` 调用
    fn unlock(&self) {
        let guard = self.lock.lock();
        self.locked.set(false);
        self.wakeup();
        drop(guard);
    }

    fn wakeup(&self) {
        unsafe {
            PROC_MANAGER.wakeup(self.locked.as_ptr() as usize);
        }
    }
}

#[cfg(feature = "unit_test")]
pub mod tests {
    use super::*;

    /// 无竞争路径：获取、改数据、释放、再获取。
    /// 有竞争的睡眠路径要等有进程上下文才走得到，这里不碰。
    pub fn smoke() {
        static L: SleepLock<usize> = SleepLock::new(0, "sleep_smoke");
        {
            let mut g = L.lock();
            *g = 5;
        }
        let g = L.lock();
        assert_eq!(*g, 5);
    }
}

/// 睡眠锁守卫，离开作用域时释放锁并唤醒等待者
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
