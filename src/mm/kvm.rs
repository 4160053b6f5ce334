//! 内核虚拟内存空间管理

use core::arch::asm;
use core::convert::{Into, TryFrom};
use core::mem;

use crate::consts::{
    CLINT, CLINT_MAP_SIZE, KERNBASE, PGSIZE, PHYSTOP, TRAMPOLINE, UART0, UART0_MAP_SIZE,
};
use crate::register::satp;
#[cfg(feature = "verbose_init_info")]
use super::Addr;
use super::{PageTable, PhysAddr, PteFlag, RawSinglePage, VirtAddr};

/// 内核页表根。
///
/// hart 0 在 `kvm_init` 里填充映射，之后各 hart 把它装入各自的 satp。
/// 除启动期的填充与进程内核栈的映射/解除外不再变动；
/// 内核栈相关的修改都经本模块的函数进行。
static mut KERNEL_PAGE_TABLE: PageTable = PageTable::empty();

/// 把内核页表写入本 hart 的 satp 并冲刷 TLB，开启分页
pub unsafe fn kvm_init_hart() {
    satp::write(KERNEL_PAGE_TABLE.as_satp());
    asm!("sfence.vma zero, zero");
}

/// 建立内核地址空间的恒等映射。
///
/// # 功能说明
/// 映射 UART、CLINT 两处 MMIO，内核代码段（可执行只读）、
/// 数据段与其后全部物理内存（可读写），以及最高地址处的跳板页。
/// 进程内核栈不在这里预留，由 `allocproc` 运行期逐个映射。
///
/// # 安全性
/// 只能由 hart 0 在开启分页之前调用一次。
pub unsafe fn kvm_init() {
    // RawSinglePage 与页表页必须同布局，kstack 回收依赖这一点
    debug_assert_eq!(mem::size_of::<RawSinglePage>(), PGSIZE);
    debug_assert_eq!(mem::align_of::<RawSinglePage>(), PGSIZE);
    debug_assert_eq!(mem::size_of::<RawSinglePage>(), mem::size_of::<PageTable>());
    debug_assert_eq!(mem::align_of::<RawSinglePage>(), mem::align_of::<PageTable>());

    // UART 寄存器
    kvm_map(
        VirtAddr::from(UART0),
        PhysAddr::from(UART0),
        UART0_MAP_SIZE,
        PteFlag::R | PteFlag::W,
    );

    // CLINT，定时器中断的 mtimecmp 在这里
    kvm_map(
        VirtAddr::from(CLINT),
        PhysAddr::from(CLINT),
        CLINT_MAP_SIZE,
        PteFlag::R | PteFlag::W,
    );

    // etext 由 kernel.ld 导出，页对齐
    extern "C" {
        fn etext();
    }
    let etext = etext as usize;

    // 内核代码段：可执行、只读
    kvm_map(
        VirtAddr::from(KERNBASE),
        PhysAddr::from(KERNBASE),
        etext - Into::<usize>::into(KERNBASE),
        PteFlag::R | PteFlag::X,
    );

    // 内核数据段与其后的全部物理内存
    kvm_map(
        VirtAddr::try_from(etext).unwrap(),
        PhysAddr::try_from(etext).unwrap(),
        usize::from(PHYSTOP) - etext,
        PteFlag::R | PteFlag::W,
    );

    // 跳板页映射到内核最高虚拟地址，陷阱进出用
    extern "C" {
        fn trampoline();
    }
    kvm_map(
        VirtAddr::from(TRAMPOLINE),
        PhysAddr::try_from(trampoline as usize).unwrap(),
        PGSIZE,
        PteFlag::R | PteFlag::X
    );
}

/// 在内核页表上建立映射，失败返回 `Err`。
///
/// allocproc 运行期映射内核栈用这个入口：中间级页表页分配失败
/// 属于可恢复的资源耗尽，要退给调用者去撤销半成品进程，不能 panic。
pub unsafe fn kvm_try_map(
    va: VirtAddr,
    pa: PhysAddr,
    size: usize,
    perm: PteFlag,
) -> Result<(), &'static str> {
    KERNEL_PAGE_TABLE.map_pages(va, size, pa, perm)
}

/// 在内核页表上建立 `[va, va+size)` 到 `[pa, ...)` 的映射。
/// 启动期映射失败直接 panic。
pub unsafe fn kvm_map(va: VirtAddr, pa: PhysAddr, size: usize, perm: PteFlag) {
    #[cfg(feature = "verbose_init_info")]
    println!(
        "kvm_map: va={:#x}, pa={:#x}, size={:#x}",
        va.as_usize(),
        pa.as_usize(),
        size
    );

    if let Err(err) = KERNEL_PAGE_TABLE.map_pages(va, size, pa, perm) {
        panic!("kvm_map: {}", err);
    }
}

/// 解除内核页表上自 va 起 count 页的映射。
///
/// 进程销毁时用它收回内核栈：`freeing` 为 true 时物理页帧
/// 一并还给伙伴系统；对应的虚拟地址则交回内核栈地址提供器复用。
pub unsafe fn kvm_unmap(va: usize, count: usize, freeing: bool) {
    KERNEL_PAGE_TABLE.uvm_unmap(va, count, freeing);
}
