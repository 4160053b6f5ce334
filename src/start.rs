//! 机器模式入口，每个 hart 过这里降到监督模式

use core::{arch::asm, convert::Into};

use crate::consts::{CLINT_MTIMECMP, NCPU};
use crate::dtb;
use crate::register::{
    clint, medeleg, mepc, mhartid, mideleg, mie, mscratch, mstatus, mtvec, satp, sie, tp,
};
use crate::rmain::rust_main;

/// 启动栈。entry.S 按 hartid 给每个 hart 切一页。
#[repr(C, align(16))]
pub struct Stack0([u8; NCPU * 4096]);

#[export_name = "stack0"]
pub static mut STACK0: Stack0 = Stack0([0; NCPU * 4096]);

/// 每个 hart 的机器模式暂存区，供 timervec 使用。
/// 每个 hart 占 32 个字，只用前 6 个：
/// - [0..3]：timervec 保存寄存器的空间；
/// - [4]：该 hart 的 CLINT MTIMECMP 寄存器地址；
/// - [5]：定时器中断的间隔（时钟周期）。
static mut MSCRATCH0: [usize; NCPU * 32] = [0; NCPU * 32];

/// 机器模式入口。
///
/// # 功能说明
/// entry.S 设好启动栈后带着固件传来的参数跳到这里：
/// a0 是 hartid，a1 是扁平设备树的物理地址。
/// 这里记下设备树指针、把异常与中断下放给监督模式、放开物理
/// 内存保护、装好定时器，最后 mret 降到监督模式进 rust_main。
///
/// # 安全性
/// 由启动汇编在机器模式调用，操作的全是特权寄存器。
#[no_mangle]
pub unsafe extern "C" fn start(_hartid: usize, dtb: usize) -> ! {
    // 固件只在寄存器里交一次设备树指针，先落到内存里
    dtb::record_device_tree_ptr(dtb);

    // mret 之后进监督模式
    mstatus::set_mpp(mstatus::MPP::Supervisor);

    // mret 的落点是 rust_main
    mepc::write(rust_main as usize);

    // 先不开分页
    satp::write(0);

    // 异常与中断全部下放给监督模式
    medeleg::write(0xffff);
    mideleg::write(0xffff);
    sie::intr_on();

    // 放开物理内存保护，让监督模式能访问全部内存
    asm!("
        li t0, -1
        csrw pmpaddr0, t0
        li t0, 0x7f
        csrw pmpcfg0, t0
    ");

    // 申请时钟中断
    timerinit();

    // hartid 放进 tp，供 cpu_id() 使用
    let id = mhartid::read();
    tp::write(id);

    // 降到监督模式，跳 rust_main
    asm!("mret");

    // 这里不能 panic 也不能 print
    loop {}
}

/// 配置本 hart 的机器模式定时器中断。
///
/// CLINT 的定时器中断只能在机器模式收，timervec 把它转成
/// 监督模式软件中断并重新装表，内核在监督模式按时钟处理。
unsafe fn timerinit() {
    let id = mhartid::read();

    // 约 0.1 秒一跳（qemu 的时钟频率下）
    let interval: u64 = 1000000;
    clint::add_mtimecmp(id, interval);

    // 给 timervec 备好暂存区
    let offset = 32 * id;
    MSCRATCH0[offset + 4] = 8 * id + Into::<usize>::into(CLINT_MTIMECMP);
    MSCRATCH0[offset + 5] = interval as usize;
    mscratch::write((MSCRATCH0.as_ptr() as usize) + offset * core::mem::size_of::<usize>());

    // 机器模式陷阱向量指到 timervec
    extern "C" {
        fn timervec();
    }
    mtvec::write(timervec as usize);

    // 开机器模式中断与定时器中断
    mstatus::set_mie();
    mie::set_mtie();
}
