//! 多核 RISC-V 教学内核的核心：伙伴物理内存分配器、
//! 动态进程注册表与每 hart 调度器，以及它们依赖的同步原语。

#![no_std]
#![feature(slice_ptr_get)]
#![feature(allocator_api)]
#![feature(alloc_error_handler)]
#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![feature(new_zeroed_alloc)]

use core::arch::global_asm;

#[macro_use]
extern crate bitflags;

extern crate alloc;

global_asm!(include_str!("asm/entry.S"));
global_asm!(include_str!("asm/kernelvec.S"));
global_asm!(include_str!("asm/swtch.S"));
global_asm!(include_str!("asm/trampoline.S"));

#[macro_use]
mod printf;

mod consts;
mod driver;
mod dtb;
mod fs;
mod mm;
mod process;
mod protected;
mod register;
mod rmain;
mod rwlock;
mod sleeplock;
mod spinlock;
mod start;
mod trap;

#[cfg(feature = "unit_test")]
fn test_main_entry() {
    use core::sync::atomic::{AtomicBool, Ordering};
    use process::CpuManager;

    static SINGLE_DONE: AtomicBool = AtomicBool::new(false);

    let cpu_id = unsafe { CpuManager::cpu_id() };

    // 单 hart 用例集中在 hart 0 上先跑完，其余 hart 等着，
    // 免得并发分配把记账类断言搅黄
    if cpu_id == 0 {
        spinlock::tests::smoke();
        sleeplock::tests::smoke();
        rwlock::tests::smoke();
        protected::tests::smoke();
        mm::bitset::tests::ops();
        mm::freelist::tests::push_pop_unlink();
        dtb::tests::parse_blob();
        process::tests::vector_ops();
        process::tests::pid_monotonic();
        process::tests::kstack_reuse();
        process::tests::registry_scan();
        mm::kalloc::tests::accounting();
        SINGLE_DONE.store(true, Ordering::SeqCst);
    } else {
        while !SINGLE_DONE.load(Ordering::SeqCst) {}
    }

    // 多 hart 用例
    printf::tests::println_simo();
    mm::kalloc::tests::alloc_simo();

    if cpu_id == 0 {
        println!("all tests pass.");
    }
}
