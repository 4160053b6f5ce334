//! 物理地址与虚拟地址的包装类型

use core::convert::TryFrom;
use core::result::Result;

use crate::consts::{ConstAddr, MAXVA, PGMASK, PGMASKLEN, PGSHIFT, PGSIZE, PHYSTOP};

/// 两类地址共有的操作：页对齐调整、指针/整数转换
pub trait Addr {
    fn data_ref(&self) -> &usize;

    fn data_mut(&mut self) -> &mut usize;

    /// 向上取整到页边界
    #[inline]
    fn pg_round_up(&mut self) {
        *self.data_mut() = (*self.data_mut() + PGSIZE - 1) & !(PGSIZE - 1)
    }

    /// 向下取整到页边界
    #[inline]
    fn pg_round_down(&mut self) {
        *self.data_mut() = *self.data_mut() & !(PGSIZE - 1)
    }

    /// 前移一页。不检查结果是否越界。
    #[inline]
    fn add_page(&mut self) {
        *self.data_mut() += PGSIZE;
    }

    #[inline]
    fn as_usize(&self) -> usize {
        *self.data_ref()
    }

    #[inline]
    fn as_ptr(&self) -> *const u8 {
        *self.data_ref() as *const u8
    }

    #[inline]
    fn as_mut_ptr(&mut self) -> *mut u8 {
        *self.data_mut() as *mut u8
    }
}

/// 物理地址。
/// `TryFrom` 构造时检查页对齐且不超过 `PHYSTOP`。
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PhysAddr(usize);

impl Addr for PhysAddr {
    #[inline]
    fn data_ref(&self) -> &usize {
        &self.0
    }

    #[inline]
    fn data_mut(&mut self) -> &mut usize {
        &mut self.0
    }
}

impl PhysAddr {
    /// 不做检查的构造。
    ///
    /// # 安全性
    /// 调用者保证 raw 是有效的、满足使用处对齐要求的物理地址。
    #[inline]
    pub unsafe fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn into_raw(self) -> usize {
        self.0
    }
}

impl TryFrom<usize> for PhysAddr {
    type Error = &'static str;

    fn try_from(addr: usize) -> Result<Self, Self::Error> {
        if addr % PGSIZE != 0 {
            return Err("PhysAddr addr not aligned");
        }
        if addr > usize::from(PHYSTOP) {
            return Err("PhysAddr addr bigger than PHYSTOP");
        }
        Ok(PhysAddr(addr))
    }
}

impl From<ConstAddr> for PhysAddr {
    fn from(const_addr: ConstAddr) -> Self {
        Self(const_addr.into())
    }
}

/// Sv39 虚拟地址。
/// 合法值不超过 `MAXVA`，高位保持为 0。
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct VirtAddr(usize);

impl Addr for VirtAddr {
    #[inline]
    fn data_ref(&self) -> &usize {
        &self.0
    }

    #[inline]
    fn data_mut(&mut self) -> &mut usize {
        &mut self.0
    }
}

impl VirtAddr {
    /// 不做检查的构造。
    ///
    /// # 安全性
    /// 调用者保证 raw 满足 Sv39 规范（高位为 0）。
    #[inline]
    pub unsafe fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// 取 level 级页表（0 为叶子级）中本地址的 9 位页号
    #[inline]
    pub fn page_num(&self, level: usize) -> usize {
        (self.0 >> (PGSHIFT + level * PGMASKLEN)) & PGMASK
    }
}

impl TryFrom<usize> for VirtAddr {
    type Error = &'static str;

    fn try_from(addr: usize) -> Result<Self, Self::Error> {
        if addr > MAXVA.into() {
            Err("value for VirtAddr should be smaller than 1<<38")
        } else {
            Ok(Self(addr))
        }
    }
}

impl From<ConstAddr> for VirtAddr {
    fn from(const_addr: ConstAddr) -> Self {
        Self(const_addr.into())
    }
}
