//! 自旋锁模块
//! 自旋锁把被保护的数据包裹在自身内部，获取锁的同时获得数据的访问权。

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, Ordering};

use crate::process::{pop_off, push_off, CpuManager};

/// 多核环境下保护共享数据的自旋锁。
///
/// 获取锁时忙等待并关闭中断（通过 `push_off`），
/// 持有期间记录持锁 CPU 的编号，用于重入检测与 `sched` 的前置检查。
///
/// # 字段说明
/// - `lock`: 原子布尔，锁的占用状态；
/// - `name`: 锁名，panic 诊断用；
/// - `cpuid`: 当前持锁 CPU（-1 表示无人持有）；
/// - `data`: 被保护的数据，内部可变。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    cpuid: Cell<isize>,
    data: UnsafeCell<T>,
}

// 数据可跨核共享的前提是 T: Send
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            cpuid: Cell::new(-1),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取锁，返回守卫对象。
    ///
    /// 守卫实现 `Deref`/`DerefMut`，通过它访问受保护数据；
    /// 守卫离开作用域时自动释放锁并恢复中断状态。
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: &self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 当前 CPU 是否持有本锁。
    ///
    /// # 安全性
    /// 必须在中断关闭的情况下调用，否则检查期间可能被迁移。
    unsafe fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed) && (self.cpuid.get() == CpuManager::cpu_id() as isize)
    }

    /// 获取锁的核心实现。
    ///
    /// # 流程解释
    /// 1. `push_off()` 关闭中断，防止持锁期间被中断处理再次抢锁造成死锁；
    /// 2. 重入检查，同一 CPU 重复获取视为内核 bug；
    /// 3. CAS 忙等待直到拿到锁；
    /// 4. 内存屏障保证临界区读写不会被重排到获取之前；
    /// 5. 记录持锁 CPU。
    fn acquire(&self) {
        push_off();
        if unsafe { self.holding() } {
            panic!("spinlock {} acquire", self.name);
        }
        while self.lock.compare_exchange(false, true,
            Ordering::Acquire, Ordering::Acquire).is_err() {}
        fence(Ordering::SeqCst);
        unsafe { self.cpuid.set(CpuManager::cpu_id() as isize) };
    }

    /// 释放锁的核心实现，由守卫的 `Drop` 调用。
    fn release(&self) {
        if unsafe { !self.holding() } {
            panic!("spinlock {} release", self.name);
        }
        self.cpuid.set(-1);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
        pop_off();
    }

    /// 不经守卫手动释放锁。
    ///
    /// 只用于少数守卫无法跨越的路径（如 `fork_ret` 释放调度器传来的锁）。
    ///
    /// # 安全性
    /// 调用者必须确实持有本锁，且释放后不再访问受保护数据。
    pub unsafe fn unlock(&self) {
        self.release();
    }

    /// 绕开锁拿到数据的裸指针。
    ///
    /// 给"数据里本身有原子字段、读它不需要互斥"的场合用
    /// （如注册表向量的长度快照）。
    ///
    /// # 安全性
    /// 经此指针只能访问数据中自带同步的部分。
    pub fn get_ptr(&self) -> *mut T {
        self.data.get()
    }
}

/// 自旋锁守卫。守卫存在即表示锁被持有。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// 当前 CPU 是否持有守卫对应的锁。
    /// `sched` 切换上下文前用它做前置检查。
    ///
    /// # 安全性
    /// 必须在中断关闭的情况下调用。
    pub unsafe fn holding(&self) -> bool {
        self.lock.holding()
    }
}

/// 从spin crate借鉴 (https://crates.io/crates/spin)
#[cfg(feature = "unit_test")]
pub mod tests {
    use super::*;

    /// 基础功能：获取与自动释放。
    /// 两次 lock 依次成立，说明第一次的守卫离开作用域时锁被正确释放。
    pub fn smoke() {
        let m = SpinLock::new((), "smoke");
        m.lock();
        m.lock();
    }
}
