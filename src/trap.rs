//! 中断处理模块
//!
//! 本内核只接两类陷阱：机器模式定时器转发来的软件中断，
//! 和用户态的系统调用。外部设备中断的路由（PLIC）属于
//! 外部协作组件，这里不启用也不处理。

use core::num::Wrapping;
use core::sync::atomic::Ordering;

use crate::consts::{TRAMPOLINE, TRAPFRAME};
use crate::process::{CpuManager, Proc, CPU_MANAGER, PROC_MANAGER};
use crate::register::{scause::{self, ScauseType}, sepc, sip, sstatus, stval, stvec};
use crate::spinlock::SpinLock;

/// 安装本 hart 的内核陷阱向量。
/// 每个 hart 启动时调用一次。
pub unsafe fn trap_init_hart() {
    extern "C" {
        fn kernelvec();
    }

    stvec::write(kernelvec as usize);
}

/// 用户态陷阱入口，由 trampoline.S 调用。
///
/// # 流程解释
/// 1. 核对确实来自用户态，换上内核陷阱向量；
/// 2. 按 scause 分发：
///    - 软件中断：hart 0 走时钟、清挂起位、检查 kill、让出 CPU；
///    - 用户 ecall：检查 kill、分发系统调用、再查一次 kill
///      （调用期间可能被杀）；
///    - 其它：打印诊断并终止该进程；
/// 3. 回用户态。
///
/// # 安全性
/// 只能经 trampoline 在正确保存了陷阱帧之后进入。
#[no_mangle]
pub unsafe extern fn user_trap() {
    if !sstatus::is_from_user() {
        panic!("not from user mode, sstatus={:#x}", sstatus::read());
    }

    // 在内核里再陷入就走 kernelvec
    extern "C" { fn kernelvec(); }
    stvec::write(kernelvec as usize);

    let p = CPU_MANAGER.my_proc();

    match scause::get_scause() {
        ScauseType::IntSSoft => {
            if CpuManager::cpu_id() == 0 {
                clock_intr();
            }
            sip::clear_ssip();

            p.check_abondon(-1);
            p.yielding();
        }
        ScauseType::ExcUEcall => {
            p.check_abondon(-1);
            p.syscall();
            p.check_abondon(-1);
        }
        ScauseType::Unknown => {
            println!("scause {:#x}", scause::read());
            println!("sepc={:#x} stval={:#x}", sepc::read(), stval::read());
            p.abondon(-1);
        }
    }

    user_trap_ret();
}

/// 返回用户空间。
///
/// # 流程解释
/// 关中断，把陷阱向量换成跳板页里的 uservec，
/// 备好 sstatus 与陷阱帧，最后跳到跳板页里的 userret
/// 切换页表并恢复用户寄存器。
pub unsafe fn user_trap_ret() -> ! {
    sstatus::intr_off();
    sstatus::user_ret_prepare();

    stvec::write(TRAMPOLINE.into());

    let satp = {
        let pd = CPU_MANAGER.my_proc().data.get_mut();
        pd.user_ret_prepare()
    };

    // userret 在跳板页里的虚拟地址 = TRAMPOLINE + 它在段内的偏移
    extern "C" {
        fn trampoline();
        fn userret();
    }
    let distance = userret as usize - trampoline as usize;
    let userret_virt: extern "C" fn(usize, usize) -> ! =
        core::mem::transmute(Into::<usize>::into(TRAMPOLINE) + distance);

    userret_virt(TRAPFRAME.into(), satp);
}

/// 内核态陷阱处理，由 kernelvec 调用。
///
/// 软件中断走时钟并尝试让当前进程让路；
/// 其余陷阱在内核态都不该出现，panic。
#[no_mangle]
pub unsafe fn kerneltrap() {
    let local_sepc = sepc::read();
    let local_sstatus = sstatus::read();

    if !sstatus::is_from_supervisor() {
        panic!("not from supervisor mode");
    }
    if sstatus::intr_get() {
        panic!("interrupts enabled");
    }

    match scause::get_scause() {
        ScauseType::IntSSoft => {
            if CpuManager::cpu_id() == 0 {
                clock_intr();
            }
            sip::clear_ssip();

            CPU_MANAGER.my_cpu_mut().try_yield_proc();
        }
        ScauseType::ExcUEcall => {
            panic!("ecall from supervisor mode");
        }
        ScauseType::Unknown => {
            println!("scause {:#x}", scause::read());
            println!("sepc={:#x} stval={:#x}", sepc::read(), stval::read());
            panic!("unknown trap type");
        }
    }

    // try_yield_proc 可能切走过，sepc/sstatus 要用进来时的副本恢复
    sepc::write(local_sepc);
    sstatus::write(local_sstatus);
}

/// 时钟滴答计数
static TICKS: SpinLock<Wrapping<usize>> = SpinLock::new(Wrapping(0), "time");

/// 时钟中断：滴答加一，唤醒睡在时钟上的进程
fn clock_intr() {
    let mut guard = TICKS.lock();
    *guard += Wrapping(1);
    unsafe { PROC_MANAGER.wakeup(&TICKS as *const _ as usize); }
    drop(guard);
}

/// 让进程睡过 count 个时钟滴答。
/// 睡眠期间被 kill 返回 `Err`。
pub fn clock_sleep(p: &Proc, count: usize) -> Result<(), ()> {
    let mut guard = TICKS.lock();
    let old_ticks = *guard;

    while (*guard - old_ticks) < Wrapping(count) {
        if p.killed.load(Ordering::Relaxed) {
            return Err(())
        }
        p.sleep(&TICKS as *const _ as usize, guard);
        guard = TICKS.lock();
    }
    Ok(())
}

/// 启动以来的时钟滴答数
pub fn clock_read() -> usize {
    TICKS.lock().0
}
