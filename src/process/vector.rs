//! 机器字动态数组
//!
//! 槽位是 usize，存裸指针或普通整数都行。进程注册表和内核栈地址池
//! 都用它。`size` 用原子数维护：写入方先写好槽位再增长 `size`，
//! 读取方（调度器等）就可以不加锁地快照一个安全的遍历上界——
//! 快照只会偏小，不会把没写完的槽位暴露出去。

use core::alloc::Layout;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::alloc::{alloc_zeroed, dealloc};

/// 动态数组。容量从 4 开始，每次翻倍。
///
/// 除 `len` 之外的方法都要求独占访问（外层加锁），
/// `len` 可以无锁读。
pub struct Vector {
    size: AtomicUsize,
    capacity: usize,
    data: *mut usize,
}

// 裸指针字段只在外层锁内访问
unsafe impl Send for Vector {}

impl Vector {
    pub const fn new() -> Self {
        Self {
            size: AtomicUsize::new(0),
            capacity: 0,
            data: ptr::null_mut(),
        }
    }

    /// 当前元素个数。无锁读，作为快照只偏小不偏大。
    #[inline]
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// 扩容到 new_capacity。
    /// 新存储来自全局（伙伴）分配器并清零，旧内容搬过去后旧存储归还。
    /// 分配失败返回 `Err`，数组保持原样。
    fn try_grow(&mut self, new_capacity: usize) -> Result<(), ()> {
        let new_layout = Layout::array::<usize>(new_capacity).map_err(|_| ())?;
        let new_data = unsafe { alloc_zeroed(new_layout) } as *mut usize;
        if new_data.is_null() {
            return Err(())
        }

        let size = self.len();
        if !self.data.is_null() {
            unsafe {
                ptr::copy_nonoverlapping(self.data, new_data, size);
                let old_layout = Layout::array::<usize>(self.capacity).unwrap();
                dealloc(self.data as *mut u8, old_layout);
            }
        }
        self.data = new_data;
        self.capacity = new_capacity;
        Ok(())
    }

    /// 读第 i 个槽位。
    ///
    /// # Panics
    /// 越界时 panic，越界读属于内核 bug。
    pub fn get(&self, i: usize) -> usize {
        if self.len() <= i {
            panic!("vector out of bounds get");
        }
        unsafe { ptr::read(self.data.add(i)) }
    }

    /// 写第 i 个槽位。
    ///
    /// # Panics
    /// 越界时 panic。
    pub fn set(&mut self, i: usize, val: usize) {
        if self.len() <= i {
            panic!("vector out of bounds set");
        }
        unsafe { ptr::write(self.data.add(i), val); }
    }

    /// 尾部追加。容量不足先翻倍扩容，扩容失败返回 `Err`。
    ///
    /// 先写槽位、后用原子加发布 `size`，
    /// 无锁快照 `len` 的读者看不到半成品。
    pub fn push_back(&mut self, val: usize) -> Result<(), ()> {
        let size = self.len();
        if size == self.capacity {
            let new_capacity = if self.capacity == 0 { 4 } else { self.capacity * 2 };
            self.try_grow(new_capacity)?;
        }
        unsafe { ptr::write(self.data.add(size), val); }
        self.size.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// 弹出并返回最后一个元素。
    ///
    /// # Panics
    /// 空数组弹出 panic。
    pub fn pop_back(&mut self) -> usize {
        let size = self.len();
        if size == 0 {
            panic!("vector pop from empty");
        }
        self.size.fetch_sub(1, Ordering::Release);
        unsafe { ptr::read(self.data.add(size - 1)) }
    }

    /// 把 val 填进第一个值为 0 的槽位（墓碑复用），
    /// 没有墓碑就追加到尾部。返回槽位下标，空间不足返回 `None`。
    pub fn replace_first_zero(&mut self, val: usize) -> Option<usize> {
        let size = self.len();
        for i in 0..size {
            if self.get(i) == 0 {
                self.set(i, val);
                return Some(i)
            }
        }
        self.push_back(val).ok()?;
        Some(size)
    }

    /// 把元素个数调整为 new_size。
    /// 增长出的槽位填 0（墓碑），超出容量时扩容，失败返回 `Err`。
    pub fn resize(&mut self, new_size: usize) -> Result<(), ()> {
        if new_size > self.capacity {
            let mut new_capacity = if self.capacity == 0 { 4 } else { self.capacity };
            while new_capacity < new_size {
                new_capacity *= 2;
            }
            self.try_grow(new_capacity)?;
        }
        let size = self.len();
        for i in new_size..size {
            // 收缩时清掉弃用的槽位，后续 grow 的搬运不会复活旧值
            unsafe { ptr::write(self.data.add(i), 0); }
        }
        for i in size..new_size {
            unsafe { ptr::write(self.data.add(i), 0); }
        }
        self.size.store(new_size, Ordering::Release);
        Ok(())
    }
}

impl Drop for Vector {
    fn drop(&mut self) {
        if !self.data.is_null() {
            let layout = Layout::array::<usize>(self.capacity).unwrap();
            unsafe { dealloc(self.data as *mut u8, layout); }
        }
    }
}

#[cfg(feature = "unit_test")]
pub mod tests {
    use super::*;

    /// push/get/set/墓碑复用/pop/resize 一圈，size 只在注册表式用法里增长
    pub fn ops() {
        let mut v = Vector::new();
        assert_eq!(v.len(), 0);

        // 追加触发从 4 开始的扩容
        for i in 1..=6usize {
            v.push_back(i * 10).unwrap();
        }
        assert_eq!(v.len(), 6);
        assert_eq!(v.get(0), 10);
        assert_eq!(v.get(5), 60);

        // 打墓碑再复用
        v.set(2, 0);
        v.set(4, 0);
        assert_eq!(v.replace_first_zero(77), Some(2));
        assert_eq!(v.replace_first_zero(88), Some(4));
        assert_eq!(v.replace_first_zero(99), Some(6));
        assert_eq!(v.len(), 7);
        assert_eq!(v.get(2), 77);
        assert_eq!(v.get(6), 99);

        assert_eq!(v.pop_back(), 99);
        assert_eq!(v.len(), 6);

        v.resize(10).unwrap();
        assert_eq!(v.len(), 10);
        assert_eq!(v.get(9), 0);
        assert_eq!(v.get(5), 60);
    }
}
