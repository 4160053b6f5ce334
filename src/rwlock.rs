//! 读写锁模块
//! 写者优先的读写锁：读门自旋锁序列化读者计数的更新，
//! 写门自旋锁代表对数据的独占权。第一个读者代表所有读者取走写门，
//! 最后一个读者归还；写者直接取写门。

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut, Drop};

use crate::spinlock::SpinLock;

/// 读写锁。
///
/// # 字段说明
/// - `read_gate`: 保护 `readers` 计数的自旋锁；
/// - `write_gate`: 数据独占权；持有即可写，读者群体共同持有则可读；
/// - `readers`: 当前读者数量，只在持有 `read_gate` 时访问；
/// - `data`: 被保护的数据。
pub struct RwLock<T: ?Sized> {
    read_gate: SpinLock<()>,
    write_gate: SpinLock<()>,
    readers: Cell<usize>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            read_gate: SpinLock::new((), name),
            write_gate: SpinLock::new((), name),
            readers: Cell::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    /// 以读者身份获取锁。
    /// 第一个读者取走写门，阻挡写者；后续读者只递增计数。
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let gate = self.read_gate.lock();
        self.readers.set(self.readers.get() + 1);
        if self.readers.get() == 1 {
            // 写门在读者守卫的 Drop 里由最后一个读者释放，
            // 不能经守卫管理，否则在这里就会被还回去
            core::mem::forget(self.write_gate.lock());
        }
        drop(gate);

        RwLockReadGuard {
            lock: &self,
            data: unsafe { &*self.data.get() },
        }
    }

    /// 以写者身份获取锁，独占访问数据
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.acquire_write();
        RwLockWriteGuard {
            lock: &self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    fn acquire_write(&self) {
        core::mem::forget(self.write_gate.lock());
    }

    fn release_read(&self) {
        let gate = self.read_gate.lock();
        self.readers.set(self.readers.get() - 1);
        if self.readers.get() == 0 {
            unsafe { self.write_gate.unlock(); }
        }
        drop(gate);
    }

    fn release_write(&self) {
        unsafe { self.write_gate.unlock(); }
    }
}

/// 读者守卫，只提供不可变访问
pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    data: &'a T,
}

impl<'a, T: ?Sized> Deref for RwLockReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.data
    }
}

impl<'a, T: ?Sized> Drop for RwLockReadGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// 写者守卫，独占可变访问
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for RwLockWriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for RwLockWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for RwLockWriteGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[cfg(feature = "unit_test")]
pub mod tests {
    use super::*;

    /// 读-读共存与读写交替。
    /// 同一 hart 上两个读者叠加后写者仍能拿到锁，
    /// 说明读者计数与写门的交接是成对的。
    pub fn smoke() {
        let l = RwLock::new(0usize, "rwlock_smoke");
        {
            let r1 = l.read();
            let r2 = l.read();
            assert_eq!(*r1, 0);
            assert_eq!(*r2, 0);
        }
        {
            let mut w = l.write();
            *w = 42;
        }
        let r = l.read();
        assert_eq!(*r, 42);
    }
}
