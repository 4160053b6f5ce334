//! 内存管理模块

use alloc::boxed::Box;
use core::{alloc::AllocError, ptr};

use crate::consts::PGSIZE;
use crate::process::CPU_MANAGER;

pub use addr::{Addr, PhysAddr, VirtAddr};
pub use kvm::{kvm_init, kvm_init_hart, kvm_map, kvm_try_map, kvm_unmap};
pub use pagetable::{PageTable, PteFlag};
pub use kalloc::KERNEL_HEAP;

mod addr;
pub mod bitset;
pub mod freelist;
pub mod kalloc;
mod kvm;
mod pagetable;

/// 物理页帧的分配接口。
///
/// 为页对齐的内存块类型提供统一的分配/释放方法，
/// 底层通过 `Box` 走全局的伙伴分配器。
/// 陷阱帧、内核栈、页表页和用户页都经由本接口取得单页帧。
pub trait RawPage: Sized {
    /// 分配一个清零的物理页，返回页首地址。
    ///
    /// # 安全性
    /// 返回的指针必须用 `from_raw_and_drop` 释放，且不能重复释放。
    unsafe fn new_zeroed() -> *mut u8 {
        let boxed_page = Box::<Self>::new_zeroed().assume_init();
        Box::into_raw(boxed_page) as *mut u8
    }

    /// 同 `new_zeroed`，但内存不足时返回错误而不是 panic
    unsafe fn try_new_zeroed() -> Result<*mut u8, AllocError> {
        let boxed_page = Box::<Self>::try_new_zeroed()?.assume_init();
        Ok(Box::into_raw(boxed_page) as *mut u8)
    }

    /// 分配一个未初始化的物理页。
    /// 调用者使用前必须完成初始化。
    unsafe fn try_new_uninit() -> Result<*mut u8, AllocError> {
        let boxed_page = Box::<Self>::try_new_uninit()?.assume_init();
        Ok(Box::into_raw(boxed_page) as *mut u8)
    }

    /// 释放由 `new_*` 方法分配的物理页。
    ///
    /// # 安全性
    /// `raw` 必须来自本接口的分配，调用后立即失效。
    unsafe fn from_raw_and_drop(raw: *mut u8) {
        drop(Box::from_raw(raw as *mut Self));
    }
}

/// 单页（4096 字节）的物理帧
#[repr(C, align(4096))]
pub struct RawSinglePage {
    data: [u8; PGSIZE],
}

impl RawPage for RawSinglePage {}

/// 同时涵盖用户虚拟地址与内核指针的地址类型。
///
/// 内核与用户空间之间的缓冲区搬运统一经过该类型：
/// 目标/来源是用户虚拟地址时走当前进程页表逐页拷贝，
/// 是内核指针时直接 `ptr::copy`。
#[derive(Clone, Copy, Debug)]
pub enum Address {
    Virtual(usize),
    Kernel(*const u8),
    KernelMut(*mut u8),
}

impl Address {
    /// 地址前移 count 字节，返回新地址
    pub fn offset(self, count: usize) -> Self {
        debug_assert!(count < (isize::MAX) as usize);
        match self {
            Self::Virtual(p) => Self::Virtual(p + count),
            Self::Kernel(p) => Self::Kernel(unsafe { p.offset(count as isize) }),
            Self::KernelMut(p) => Self::KernelMut(unsafe { p.offset(count as isize) }),
        }
    }

    /// 从内核缓冲区 src 向本地址复制 count 字节。
    /// 只读的内核指针不可作为目标。
    pub fn copy_out(self, src: *const u8, count: usize) -> Result<(), ()> {
        match self {
            Self::Virtual(dst) => {
                let p = unsafe { CPU_MANAGER.my_proc() };
                p.data.get_mut().copy_out(src, dst, count)
            },
            Self::Kernel(dst) => {
                panic!("cannot copy to a const pointer {:p}", dst)
            },
            Self::KernelMut(dst) => {
                unsafe { ptr::copy(src, dst, count); }
                Ok(())
            },
        }
    }

    /// 从本地址向内核缓冲区 dst 复制 count 字节
    pub fn copy_in(self, dst: *mut u8, count: usize) -> Result<(), ()> {
        match self {
            Self::Virtual(src) => {
                let p = unsafe { CPU_MANAGER.my_proc() };
                p.data.get_mut().copy_in(src, dst, count)
            },
            Self::Kernel(src) => {
                unsafe { ptr::copy(src, dst, count); }
                Ok(())
            },
            Self::KernelMut(src) => {
                debug_assert!(false);
                unsafe { ptr::copy(src, dst, count); }
                Ok(())
            },
        }
    }
}

/// 向上取整到页边界
#[inline]
pub fn pg_round_up(address: usize) -> usize {
    (address + (PGSIZE - 1)) & !(PGSIZE - 1)
}

/// 向下取整到页边界
#[inline]
pub fn pg_round_down(address: usize) -> usize {
    address & !(PGSIZE - 1)
}
