//! 处理器状态管理：每个 hart 的调度器、当前进程与中断嵌套计数

use array_macro::array;

use core::ptr;

use crate::consts::NCPU;
use crate::register::{sfence_vma_va, sstatus, tp};
use crate::spinlock::SpinLockGuard;

use super::pool::FREE_PROC_POOL;
use super::proc::ProcExcl;
use super::{Context, Proc, ProcState, PROC_MANAGER};

/// 全局 CPU 管理器。
///
/// 每个 hart 一个 `Cpu` 槽位，记录该 hart 当前运行的进程、
/// 调度器自己的上下文与关中断嵌套计数。
/// 槽位只被对应的 hart 访问，访问前提是中断已关闭。
pub static mut CPU_MANAGER: CpuManager = CpuManager::new();

/// 调度器每转这么多圈就去待回收池里清一次账
const FREE_POOL_DRAIN_ROUNDS: usize = 1000;

pub struct CpuManager {
    table: [Cpu; NCPU],
}

impl CpuManager {
    const fn new() -> Self {
        Self {
            table: array![_ => Cpu::new(); NCPU],
        }
    }

    /// 当前 hart 的编号。
    /// 必须在关中断时调用，否则读到一半可能被迁移到别的 hart。
    #[inline]
    pub unsafe fn cpu_id() -> usize {
        tp::read()
    }

    /// 当前 hart 的 Cpu 结构。必须关中断。
    unsafe fn my_cpu(&self) -> &Cpu {
        let id = Self::cpu_id();
        &self.table[id]
    }

    /// 当前 hart 的 Cpu 结构（可变）。必须关中断。
    pub unsafe fn my_cpu_mut(&mut self) -> &mut Cpu {
        let id = Self::cpu_id();
        &mut self.table[id]
    }

    /// 当前 hart 上运行的进程。
    ///
    /// # Panics
    /// 调度器上下文里没有进程在跑，此时调用 panic。
    pub fn my_proc(&self) -> &mut Proc {
        let p;
        push_off();
        unsafe {
            let c = self.my_cpu();
            if c.proc.is_null() {
                panic!("my_proc(): no process running");
            }
            p = &mut *c.proc;
        }
        pop_off();
        p
    }

    /// 当前 hart 上运行进程的裸指针，可能为空。
    /// wakeup 用它来跳过自己，调度器上下文里返回空指针。
    pub unsafe fn my_proc_ptr(&self) -> *mut Proc {
        push_off();
        let p = self.my_cpu().proc;
        pop_off();
        p
    }

    /// 每个 hart 的调度器主循环，永不返回。
    ///
    /// # 流程解释
    /// 每一圈：
    /// 1. 圈数攒够 [`FREE_POOL_DRAIN_ROUNDS`] 就 drain 一次待回收池，
    ///    watching 归零的进程记录在这里真正回到伙伴分配器；
    /// 2. 开中断。所有进程都在睡时，hart 要能响应定时器，
    ///    否则互相等锁的 hart 可能死锁；
    /// 3. 无锁快照注册表长度（size 只增，偏小无妨），逐槽 claim：
    ///    拿到进程先加 excl 锁，RUNNABLE 的置 RUNNING、记到本 hart、
    ///    冲掉它内核栈地址的旧 TLB 表项，swtch 过去；
    ///    切回来后清掉本 hart 的当前进程；
    /// 4. 放锁、stop_watching，看下一个槽位。
    ///
    /// 进程让出是自愿的：它改好自己的状态后经 sched 切回这里。
    ///
    /// # 安全性
    /// 只能在每个 hart 完成启动初始化后调用；
    /// swtch 依赖上下文布局与 swtch.S 一致。
    pub unsafe fn scheduler(&mut self) -> ! {
        extern "C" {
            fn swtch(old: *mut Context, new: *mut Context);
        }

        let c = self.my_cpu_mut();
        let mut rounds: usize = 0;

        loop {
            // 也许有进程记录等着最终回收？
            rounds += 1;
            if rounds == FREE_POOL_DRAIN_ROUNDS {
                rounds = 0;
                FREE_PROC_POOL.drain();
            }

            // 确保设备能中断进来
            sstatus::intr_on();

            let proc_number = PROC_MANAGER.list_len();
            for i in 0..proc_number {
                let p = match PROC_MANAGER.claim_proc(i) {
                    None => continue,
                    Some(p) => p,
                };
                let pr = &mut *p;

                let mut guard = pr.excl.lock();
                if guard.state == ProcState::RUNNABLE {
                    // 切过去。放锁再把锁拿回来是进程自己的事。
                    guard.state = ProcState::RUNNING;
                    c.proc = p;

                    // 这个内核栈虚拟地址可能刚换过物理页帧，
                    // TLB 里的旧映射必须先冲掉
                    sfence_vma_va(pr.data.get_mut().kstack());

                    swtch(&mut c.scheduler as *mut Context,
                        pr.data.get_mut().get_context());

                    // 进程暂时跑完了。
                    // 回来之前它应当已经改好了自己的状态。
                    c.proc = ptr::null_mut();
                }
                drop(guard);

                PROC_MANAGER.stop_watching(p);
            }
        }
    }
}

/// 单个 hart 的状态
pub struct Cpu {
    /// 本 hart 当前运行的进程，空闲时为空指针
    proc: *mut Proc,
    /// 调度器自身的上下文，进程 sched 回来时的切换目标
    scheduler: Context,
    /// 关中断嵌套层数
    noff: u8,
    /// 最外层 push_off 之前中断是否开着
    intena: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: ptr::null_mut(),
            scheduler: Context::new(),
            noff: 0,
            intena: false,
        }
    }

    /// 从当前进程切回调度器，期间进程的 excl 锁一直握着。
    ///
    /// # 流程解释
    /// 切换前核对四个前置条件，违反任何一个都是内核 bug：
    /// 1. 确实持有本进程的锁；
    /// 2. 本 hart 恰好只持有这一把锁（noff == 1）——
    ///    多持锁切出去，别的 hart 会在这些锁上饿死；
    /// 3. 进程状态已经改离 RUNNING；
    /// 4. 中断已关。
    /// intena 要手工腾挪：它是"这个内核线程"的属性，
    /// 而 swtch 之后 Cpu 结构属于别的线程了。
    ///
    /// # 返回值
    /// 把传入的锁守卫原样交还，调用者继续持锁收尾。
    pub unsafe fn sched<'a>(&mut self, guard: SpinLockGuard<'a, ProcExcl>, ctx: *mut Context)
        -> SpinLockGuard<'a, ProcExcl>
    {
        extern "C" {
            fn swtch(old: *mut Context, new: *mut Context);
        }

        if !guard.holding() {
            panic!("sched(): not holding proc's lock");
        }
        if self.noff != 1 {
            panic!("sched(): cpu hold multi locks");
        }
        if guard.state == ProcState::RUNNING {
            panic!("sched(): proc is running");
        }
        if sstatus::intr_get() {
            panic!("sched(): interruptible");
        }

        let intena = self.intena;
        swtch(ctx, &mut self.scheduler as *mut Context);
        self.intena = intena;

        guard
    }

    /// 时钟中断路径上尝试让当前进程让出 CPU。
    /// 本 hart 没有进程或进程不在运行态就什么都不做。
    pub fn try_yield_proc(&mut self) {
        if !self.proc.is_null() {
            let guard = unsafe {
                self.proc.as_mut().unwrap().excl.lock()
            };
            if guard.state == ProcState::RUNNING {
                drop(guard);
                unsafe { self.proc.as_mut().unwrap().yielding(); }
            } else {
                drop(guard);
            }
        }
    }
}

/// 关中断并把嵌套层数加一。
/// 与 pop_off 成对使用，只有最外层的 pop_off 才真正恢复中断。
pub fn push_off() {
    let old = sstatus::intr_get();
    sstatus::intr_off();
    let c = unsafe { CPU_MANAGER.my_cpu_mut() };
    if c.noff == 0 {
        c.intena = old;
    }
    c.noff += 1;
}

/// 嵌套层数减一，归零且之前中断开着才重新开中断。
///
/// # Panics
/// 中断开着时调用，或与 push_off 不配对，都是内核 bug，panic。
pub fn pop_off() {
    if sstatus::intr_get() {
        panic!("pop_off(): interruptable");
    }
    let c = unsafe { CPU_MANAGER.my_cpu_mut() };
    if c.noff.checked_sub(1).is_none() {
        panic!("pop_off(): count not match");
    }
    c.noff -= 1;
    if c.noff == 0 && c.intena {
        sstatus::intr_on();
    }
}
