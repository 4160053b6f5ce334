//! 内核主入口，完成各 hart 的初始化并进入调度器

use core::convert::Into;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::consts::PHYSTOP;
use crate::driver::console;
use crate::dtb;
use crate::mm::{kvm_init, kvm_init_hart, KERNEL_HEAP};
use crate::process::{CPU_MANAGER, PROC_MANAGER};
use crate::register::tp;
use crate::trap::trap_init_hart;

/// 主核（hart 0）是否完成了全局初始化。
/// 其余 hart 在这上面自旋，等全局资源都就位才继续。
static STARTED: AtomicBool = AtomicBool::new(false);

/// 监督模式入口，start 的 mret 落点。
///
/// # 流程解释
/// hart 0 按依赖顺序建全局资源：控制台 → 设备树（校验头部、
/// 算出堆底）→ 伙伴分配器 → 内核页表 → 进程注册表 → 开分页 →
/// 陷阱向量 → 第一个用户进程；其余 hart 等 STARTED 置位后
/// 只做自己那份：开分页、装陷阱向量。
/// 所有 hart 最后都进调度器，永不返回。
///
/// # 安全性
/// 早期初始化期间全局资源尚未建立安全抽象，
/// 必须保证 hart 0 单独完成全局部分。
pub unsafe fn rust_main() -> ! {
    let cpuid = tp::read();

    if cpuid == 0 {
        console::init();
        println!();
        println!("xv6-buddy kernel is booting");
        println!();
        let heap_base = dtb::heap_base();            // 设备树给出堆底
        KERNEL_HEAP.kinit(heap_base, PHYSTOP.into()); // 物理内存分配器
        kvm_init();                                   // 内核页表
        PROC_MANAGER.proc_init();                     // 进程注册表
        kvm_init_hart();                              // 开分页
        trap_init_hart();                             // 内核陷阱向量
        PROC_MANAGER.user_init();                     // 第一个用户进程

        STARTED.store(true, Ordering::SeqCst);
    } else {
        while !STARTED.load(Ordering::SeqCst) {}

        println!("hart {} starting", cpuid);
        kvm_init_hart();
        trap_init_hart();
    }

    #[cfg(feature = "unit_test")]
    crate::test_main_entry();

    CPU_MANAGER.scheduler();
}
