//! 受保护指针模块
//! 自旋锁加一个指针槽位：要么"槽位为空则安装新指针并继续持锁"，
//! 要么放弃并立即还锁。用于只安装一次、之后只读的全局指针
//! （如 init 进程的记录）。

use core::cell::Cell;

use crate::spinlock::SpinLock;

/// 自旋锁保护的裸指针槽位。
///
/// 空槽位用空指针表示。`test_empty_and_install` 的"测试并安装"
/// 在一次持锁中完成，安装成功后锁继续由调用者持有，
/// 让调用者能在放开锁之前完成与指针相关的其余初始化。
pub struct ProtectedPtr<T> {
    ptr: Cell<*mut T>,
    lock: SpinLock<()>,
}

unsafe impl<T> Sync for ProtectedPtr<T> {}

impl<T> ProtectedPtr<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            ptr: Cell::new(core::ptr::null_mut()),
            lock: SpinLock::new((), name),
        }
    }

    /// 取锁并读出指针，随后立即还锁。
    /// 槽位未安装时返回空指针。
    pub fn get(&self) -> *mut T {
        let guard = self.lock.lock();
        let p = self.ptr.get();
        drop(guard);
        p
    }

    /// 槽位为空则安装 `ptr` 并保持持锁，返回 true；
    /// 否则还锁并返回 false。
    ///
    /// 返回 true 后调用者必须调用 [`release`] 放开锁。
    ///
    /// [`release`]: Self::release
    pub fn test_empty_and_install(&self, ptr: *mut T) -> bool {
        let guard = self.lock.lock();
        if self.ptr.get().is_null() {
            self.ptr.set(ptr);
            core::mem::forget(guard);
            return true;
        }
        drop(guard);
        false
    }

    /// 放开 `test_empty_and_install` 保持住的锁。
    ///
    /// # 安全性
    /// 只能在 `test_empty_and_install` 返回 true 之后调用一次。
    pub unsafe fn release(&self) {
        self.lock.unlock();
    }
}

#[cfg(feature = "unit_test")]
pub mod tests {
    use super::*;

    /// 安装语义：空槽安装成功且保持锁，二次安装失败且不破坏已有值。
    pub fn smoke() {
        static SLOT: ProtectedPtr<usize> = ProtectedPtr::new("pp_smoke");
        static mut VALUE: usize = 7;

        assert!(SLOT.get().is_null());
        let installed = SLOT.test_empty_and_install(core::ptr::addr_of_mut!(VALUE));
        assert!(installed);
        unsafe { SLOT.release(); }

        static mut OTHER: usize = 8;
        assert!(!SLOT.test_empty_and_install(core::ptr::addr_of_mut!(OTHER)));
        assert_eq!(SLOT.get(), core::ptr::addr_of_mut!(VALUE));
    }
}
