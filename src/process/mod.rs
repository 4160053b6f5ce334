//! 进程管理模块
//!
//! 与固定长度的进程表不同，这里的进程记录按需从伙伴分配器整块
//! 分出，登记在一张带墓碑的动态注册表里。遍历者（调度器、wait、
//! wakeup、kill、reparent、procdump）一律通过 claim 拿指针：
//! 注册表锁内把该记录的 watching 计数加一，用完再减回去。
//! freeproc 只把记录从注册表摘下、推进待回收池，
//! watching 归零前记录的内存一直有效。

use alloc::boxed::Box;
use core::convert::TryFrom;
use core::mem;
use core::sync::atomic::Ordering;

use crate::consts::{fs::ROOTDEV, PGSIZE};
use crate::fs;
use crate::mm::{kvm_try_map, kvm_unmap, PageTable, PhysAddr, PteFlag, RawPage, RawSinglePage, VirtAddr};
use crate::protected::ProtectedPtr;
use crate::spinlock::{SpinLock, SpinLockGuard};
use crate::trap::user_trap_ret;

pub use cpu::{pop_off, push_off, CpuManager, CPU_MANAGER};
pub use proc::{Proc, ProcState};

mod context;
mod cpu;
mod kstack;
mod pool;
mod proc;
mod syscall;
mod trapframe;
mod vector;

use context::Context;
use kstack::KSTACK_POOL;
use pool::FREE_PROC_POOL;
use proc::ProcExcl;
use trapframe::TrapFrame;
use vector::Vector;

/// 全局进程管理器。
///
/// 持有进程注册表、pid 计数器与 wait_lock。
/// hart 0 在启动时经 `proc_init`/`user_init` 初始化，
/// 之后所有进程生命周期操作都经它进行。
pub static mut PROC_MANAGER: ProcManager = ProcManager::new();

/// init 进程的记录。`user_init` 装入一次，之后只读。
static INIT_PROC: ProtectedPtr<Proc> = ProtectedPtr::new("init_proc");

/// 进程管理器。
///
/// 锁序约定：`wait_lock` 在任何进程 excl 锁之前获取；
/// 注册表锁、pid 锁、池锁、内核栈池锁都是叶子锁，
/// 不会在持有它们时再去拿进程锁。
pub struct ProcManager {
    /// 进程注册表：槽位是 `*mut Proc` 或 0（墓碑）。
    /// 槽位访问必须经注册表锁；size 只增，可无锁快照。
    list: SpinLock<Vector>,
    /// 串起父子之间的退出与等待，防止 wakeup 丢失；
    /// 进程的 parent 字段也只在持有它时读写
    wait_lock: SpinLock<()>,
    /// 下一个待发放的 pid，从 1 起单调增长
    next_pid: SpinLock<usize>,
}

impl ProcManager {
    const fn new() -> Self {
        Self {
            list: SpinLock::new(Vector::new(), "proc lock"),
            wait_lock: SpinLock::new((), "wait_lock"),
            next_pid: SpinLock::new(1, "nextpid"),
        }
    }

    /// 建立空的进程注册表。
    ///
    /// 预先铺开 4 个墓碑槽位，第一次 allocproc 不必在注册表锁内
    /// 再去找伙伴分配器扩容。
    ///
    /// # 安全性
    /// 只能由 hart 0 在启动时调用一次，此时没有并发访问。
    pub unsafe fn proc_init(&mut self) {
        self.list.lock().resize(4).expect("proc registry init");
    }

    /// 发放一个新的 pid，正整数、只增不减
    fn alloc_pid(&self) -> usize {
        let mut pid = self.next_pid.lock();
        let ret_pid = *pid;
        *pid += 1;
        ret_pid
    }

    /// 把进程登记进注册表：优先复用墓碑槽位。
    /// 返回槽位下标；注册表扩容失败返回 `None`。
    fn push_proc(&self, p: *mut Proc) -> Option<usize> {
        self.list.lock().replace_first_zero(p as usize)
    }

    /// 把注册表第 index 槽改回墓碑。index 为 -1 表示不在表中，直接返回。
    fn remove_proc_from_list(&self, index: isize) {
        if index == -1 {
            return;
        }
        self.list.lock().set(index as usize, 0);
    }

    /// 注册表的无锁长度快照。
    /// size 只增且是原子量，快照只偏小，作遍历上界是安全的。
    #[inline]
    pub fn list_len(&self) -> usize {
        unsafe { (*self.list.get_ptr()).len() }
    }

    /// 取注册表第 i 个槽位的进程指针，同时把它的 watching 加一。
    ///
    /// # 功能说明
    /// 注册表槽位只能经本方法取用：watching 的递增发生在注册表
    /// 锁内，freeproc 摘除槽位同样要过这把锁，所以拿到的指针在
    /// `stop_watching` 之前一定有效。墓碑或越界返回 `None`。
    pub fn claim_proc(&self, i: usize) -> Option<*mut Proc> {
        let list = self.list.lock();
        if i >= list.len() {
            return None;
        }
        let p = list.get(i) as *mut Proc;
        if p.is_null() {
            return None;
        }
        // stop_watching 不拿任何锁，这里的递增必须是原子的
        unsafe { (*p).watching.fetch_add(1, Ordering::SeqCst); }
        Some(p)
    }

    /// 不再使用 claim 来的指针时调用
    pub fn stop_watching(&self, p: *mut Proc) {
        unsafe { (*p).watching.fetch_sub(1, Ordering::SeqCst); }
    }

    /// 在 wait_lock 下把 child 的父进程设为 parent
    pub unsafe fn set_parent(&self, child: *mut Proc, parent: *mut Proc) {
        let guard = self.wait_lock.lock();
        (*child).set_parent_raw(parent);
        drop(guard);
    }

    /// 分配并初始化一个新进程记录。
    ///
    /// # 功能说明
    /// 1. 记录本体从伙伴分配器分出，pid 取新值、状态 USED；
    /// 2. 分一页物理帧作内核栈，映射到地址提供器发放的虚拟地址；
    /// 3. 分陷阱帧页；建用户页表（跳板页与陷阱帧页已映射好）；
    /// 4. 上下文指向 fork_ret；
    /// 5. 登记进注册表，记下槽位下标。
    ///
    /// 任何一步资源不足都经 `free_proc` 撤销已建好的部分并返回
    /// `None`。注册表扩容失败时 `list_index` 保持 -1，
    /// 撤销路径不会去碰注册表的 0 号槽。
    ///
    /// # 返回值
    /// 新记录的裸指针；资源不足返回 `None`。
    pub fn alloc_proc(&mut self) -> Option<*mut Proc> {
        let pid = self.alloc_pid();

        let p = match Box::try_new(Proc::new(pid)) {
            Ok(boxed) => Box::into_raw(boxed),
            Err(_) => return None,
        };
        let pr = unsafe { &mut *p };
        let pd = pr.data.get_mut();

        // 内核栈：一页物理帧 + 提供器发放的虚拟地址
        let kstack_page = match unsafe { RawSinglePage::try_new_uninit() } {
            Ok(page) => page,
            Err(_) => {
                unsafe { self.free_proc(p, (*p).excl.lock()); }
                return None;
            }
        };
        let kstack_va = KSTACK_POOL.get_va();
        let map_result = unsafe {
            kvm_try_map(
                VirtAddr::try_from(kstack_va).unwrap(),
                PhysAddr::try_from(kstack_page as usize).unwrap(),
                PGSIZE,
                PteFlag::R | PteFlag::W,
            )
        };
        if map_result.is_err() {
            unsafe { RawSinglePage::from_raw_and_drop(kstack_page); }
            KSTACK_POOL.return_va(kstack_va);
            unsafe { self.free_proc(p, (*p).excl.lock()); }
            return None;
        }
        pd.set_kstack(kstack_va);

        // 陷阱帧页
        pd.tf = match unsafe { RawSinglePage::try_new_zeroed() } {
            Ok(page) => page as *mut TrapFrame,
            Err(_) => {
                unsafe { self.free_proc(p, (*p).excl.lock()); }
                return None;
            }
        };

        // 空的用户页表
        debug_assert!(pd.pagetable.is_none());
        match PageTable::alloc_proc_pagetable(pd.tf as usize) {
            Some(pgt) => pd.pagetable = Some(pgt),
            None => {
                unsafe { self.free_proc(p, (*p).excl.lock()); }
                return None;
            }
        }

        pd.init_context();

        // 登记。扩容失败时 list_index 保持 -1，撤销时直接跳过摘除。
        match self.push_proc(p) {
            Some(index) => pd.list_index = index as isize,
            None => {
                unsafe { self.free_proc(p, (*p).excl.lock()); }
                return None;
            }
        }

        Some(p)
    }

    /// 掏空一个进程记录并把它送进待回收池。
    ///
    /// # 功能说明
    /// 释放陷阱帧与用户页表，解除内核栈映射（物理帧还给分配器，
    /// 虚拟地址还给提供器），从注册表摘除，excl 清回 UNUSED，
    /// 最后 push 进池。真正归还记录内存要等 watching 归零。
    ///
    /// 调用者把已持有的 excl 守卫交进来，整个掏空过程都在锁内
    /// 进行，最后由本函数放锁再入池：在摘出注册表之前进程一直
    /// 对遍历者可见，claim 到它的 hart（procdump、wakeup 等）会
    /// 先拿 excl 锁再读私有数据，锁不握满全程就会读到拆了一半的
    /// 记录。注册表锁、内核栈池锁与池锁都是叶子锁，在 excl 锁内
    /// 取用不违反锁序。
    ///
    /// # 安全性
    /// `excl` 必须正是 `p` 的 excl 锁的守卫；除持锁方之外不得有
    /// 别的 hart 正在运行该进程（子进程从未运行、ZOMBIE 已停、
    /// 或 allocproc 的撤销路径）。
    pub unsafe fn free_proc(&self, p: *mut Proc, mut excl: SpinLockGuard<'_, ProcExcl>) {
        let pd = (*p).data.get().as_mut().unwrap();

        pd.cleanup();
        if pd.kstack() != 0 {
            kvm_unmap(pd.kstack(), 1, true);
            KSTACK_POOL.return_va(pd.kstack());
            pd.set_kstack(0);
        }
        self.remove_proc_from_list(pd.list_index);
        pd.list_index = -1;
        (*p).killed.store(false, Ordering::Relaxed);

        excl.cleanup();
        drop(excl);

        FREE_PROC_POOL.push(p);
    }

    /// 建立第一个用户进程。
    ///
    /// # 功能说明
    /// 装入一页 initcode（一个循环调 sleep 系统调用的小程序），
    /// 设好用户 pc/sp 与进程名，cwd 指向根目录，并把控制台安到
    /// 文件描述符 0/1/2 上（相当于 init 自己 open 三次），
    /// 最后置 RUNNABLE 交给调度器。
    ///
    /// # 安全性
    /// 只能由 hart 0 在启动时调用一次。
    pub unsafe fn user_init(&mut self) {
        let p = self.alloc_proc().expect("user_init: failed to alloc first process");
        if !INIT_PROC.test_empty_and_install(p) {
            panic!("user_init: init process already exists");
        }
        INIT_PROC.release();

        let pr = &mut *p;
        let pd = pr.data.get_mut();

        // 把 initcode 装到用户空间开头
        pd.pagetable.as_mut().unwrap().uvm_init(&INITCODE);
        pd.sz = PGSIZE;

        // 第一次"返回"用户态的 pc 与栈
        let tf = pd.tf.as_mut().unwrap();
        tf.epc = 0;
        tf.sp = PGSIZE;

        pd.set_name(b"initcode\0");

        debug_assert!(pd.cwd.is_none());
        pd.cwd = Some(fs::root_inode());

        // 控制台安到 0/1/2
        let console = fs::File::open_console().expect("user_init: open console");
        pd.open_files[0] = Some(console.clone());
        pd.open_files[1] = Some(console.clone());
        pd.open_files[2] = Some(console);

        let mut excl = pr.excl.lock();
        excl.state = ProcState::RUNNABLE;
    }

    /// 唤醒所有睡在 channel 上的进程。
    ///
    /// 调用时不得持有任何进程的 excl 锁：
    /// 本方法会逐个拿候选进程的锁来检查状态与通道。
    pub fn wakeup(&self, channel: usize) {
        let myproc = unsafe { CPU_MANAGER.my_proc_ptr() };
        let proc_number = self.list_len();
        for i in 0..proc_number {
            let p = match self.claim_proc(i) {
                None => continue,
                Some(p) => p,
            };
            if p != myproc {
                let mut guard = unsafe { (*p).excl.lock() };
                if guard.state == ProcState::SLEEPING && guard.channel == channel {
                    guard.state = ProcState::RUNNABLE;
                }
                drop(guard);
            }
            self.stop_watching(p);
        }
    }

    /// 把 p 的孩子全部过继给 init 并唤醒 init。
    /// 调用者必须持有 wait_lock；不拿任何子进程的 excl 锁，
    /// parent 字段的安全完全由 wait_lock 保证。
    fn reparent(&self, p: *mut Proc) {
        let init_proc = INIT_PROC.get();
        let proc_number = self.list_len();
        for i in 0..proc_number {
            let pp = match self.claim_proc(i) {
                None => continue,
                Some(pp) => pp,
            };
            let ppr = unsafe { &*pp };
            if ppr.parent_ptr() == p {
                ppr.set_parent_raw(init_proc);
                self.wakeup(init_proc as usize);
            }
            self.stop_watching(pp);
        }
    }

    /// 退出当前进程，不返回。
    ///
    /// # 流程解释
    /// 1. init 不许退出，panic；
    /// 2. 关文件、交还 cwd；
    /// 3. 拿 wait_lock：孩子过继给 init，唤醒（可能睡在 wait 里的）父进程；
    /// 4. 拿自己的 excl：写退出码、置 ZOMBIE；
    /// 5. 先放 wait_lock 再切调度器——状态翻成 ZOMBIE 之前
    ///    wait_lock 一直握着，并发的 wait 不会漏看这个孩子。
    pub fn exiting(&self, p: &mut Proc, exit_status: i32) -> ! {
        let pp = p as *mut Proc;
        if INIT_PROC.get() == pp {
            panic!("init exiting");
        }

        p.data.get_mut().close_files();

        let wait_guard = self.wait_lock.lock();

        self.reparent(pp);

        // 父进程可能正睡在 wait 里
        let parent = p.parent_ptr();
        self.wakeup(parent as usize);

        let mut excl = p.excl.lock();
        excl.exit_status = exit_status;
        excl.state = ProcState::ZOMBIE;
        drop(wait_guard);

        // 跳进调度器，从此不再回来
        unsafe {
            let ctx = p.data.get().as_mut().unwrap().get_context();
            CPU_MANAGER.my_cpu_mut().sched(excl, ctx);
        }

        unreachable!("zombie exit");
    }

    /// 等待任一子进程退出，返回其 pid。
    ///
    /// # 功能说明
    /// 在 wait_lock 下扫注册表找自己的孩子：
    /// - 发现 ZOMBIE 孩子：退出码拷到用户空间 addr（非 0 时），
    ///   freeproc 收尸，返回孩子的 pid；
    /// - 有孩子但都没退：睡在自己身上等 exit 的唤醒，醒来重扫；
    /// - 没有孩子或自己被 kill：返回 `Err`。
    pub fn waiting(&self, addr: usize) -> Result<usize, ()> {
        let p = unsafe { CPU_MANAGER.my_proc() };
        let pself = p as *mut Proc;
        let mut wait_guard = self.wait_lock.lock();

        loop {
            let mut have_kids = false;
            let proc_number = self.list_len();

            for i in 0..proc_number {
                let child = match self.claim_proc(i) {
                    None => continue,
                    Some(child) => child,
                };
                let childr = unsafe { &*child };

                if childr.parent_ptr() == pself {
                    // 拿孩子的锁，确定它不是还在 exit()/swtch() 半路上
                    let child_excl = childr.excl.lock();
                    have_kids = true;

                    if child_excl.state == ProcState::ZOMBIE {
                        let child_pid = child_excl.pid;
                        let exit_status = child_excl.exit_status;

                        if addr != 0 && p.data.get_mut().copy_out(
                            &exit_status as *const i32 as *const u8,
                            addr,
                            mem::size_of::<i32>(),
                        ).is_err() {
                            drop(child_excl);
                            drop(wait_guard);
                            self.stop_watching(child);
                            return Err(());
                        }
                        // 锁不放手，整个掏空过程由 free_proc 在锁内完成
                        unsafe { self.free_proc(child, child_excl); }
                        drop(wait_guard);
                        self.stop_watching(child);
                        return Ok(child_pid);
                    }
                    drop(child_excl);
                }
                self.stop_watching(child);
            }

            // 没有孩子就不必等了
            if !have_kids || p.killed.load(Ordering::Relaxed) {
                return Err(());
            }

            // 睡在自己身上，exit 的孩子会来叫醒
            p.sleep(pself as usize, wait_guard);
            wait_guard = self.wait_lock.lock();
        }
    }

    /// 按 pid 杀进程：置 killed 标记，睡着的直接拽成 RUNNABLE。
    /// 真正的退出发生在它下一次回到用户态的路上。
    pub fn kill(&self, pid: usize) -> Result<(), ()> {
        let proc_number = self.list_len();
        for i in 0..proc_number {
            let p = match self.claim_proc(i) {
                None => continue,
                Some(p) => p,
            };
            let mut guard = unsafe { (*p).excl.lock() };
            if guard.pid == pid {
                unsafe { (*p).killed.store(true, Ordering::Relaxed); }
                if guard.state == ProcState::SLEEPING {
                    // 把它从 sleep 里拽出来
                    guard.state = ProcState::RUNNABLE;
                }
                drop(guard);
                self.stop_watching(p);
                return Ok(());
            }
            drop(guard);
            self.stop_watching(p);
        }
        Err(())
    }

    /// 打印注册表与待回收池的现状，调试用
    pub fn procdump(&self) {
        println!();
        FREE_PROC_POOL.dump();
        let proc_number = self.list_len();
        println!("proc seek len is {}", proc_number);

        for i in 0..proc_number {
            let p = match self.claim_proc(i) {
                None => continue,
                Some(p) => p,
            };
            let guard = unsafe { (*p).excl.lock() };
            if guard.state != ProcState::UNUSED {
                let name = unsafe { (*p).data.get().as_ref().unwrap().name() };
                println!(
                    "pid = {}; state = {:?}; name = {}; ind = {}",
                    guard.pid,
                    guard.state,
                    core::str::from_utf8(name).unwrap_or("???"),
                    unsafe { (*p).data.get().as_ref().unwrap().list_index },
                );
            }
            drop(guard);
            self.stop_watching(p);
        }
    }
}

/// fork 出的子进程第一次被调度时经 swtch 落到这里。
///
/// 安全性说明1：调度器切过来时还握着该进程的 excl 锁，先放掉。
/// 安全性说明2：文件系统挂接要在普通进程的上下文里做
/// （它可能 sleep），所以放在第一个进程的首次返回路径上，
/// 而不是 rust_main 里。
unsafe fn fork_ret() -> ! {
    static mut INITIALIZED: bool = false;

    // 还握着调度器传来的 p->lock
    CPU_MANAGER.my_proc().excl.unlock();

    if !INITIALIZED {
        INITIALIZED = true;
        fs::init(ROOTDEV);
    }

    user_trap_ret();
}

/// 第一个用户程序：循环调 sleep 系统调用。
/// 完整系统里这里是一段调 exec("/init") 的引导码，
/// exec 与磁盘文件系统在本内核边界之外。
///
///     0x00  li   a0, 100      # 睡 100 个时钟滴答
///     0x04  li   a7, 13       # SYS_sleep
///     0x08  ecall
///     0x0c  j    0x00
static INITCODE: [u8; 16] = [
    0x13, 0x05, 0x40, 0x06, // li a0, 100
    0x93, 0x08, 0xd0, 0x00, // li a7, 13
    0x73, 0x00, 0x00, 0x00, // ecall
    0x6f, 0xf0, 0x5f, 0xff, // j -12
];

#[cfg(feature = "unit_test")]
pub mod tests {
    use core::sync::atomic::Ordering;

    use super::PROC_MANAGER;

    pub use super::kstack::tests::reuse as kstack_reuse;
    pub use super::vector::tests::ops as vector_ops;

    /// pid 单调递增且互不相同
    pub fn pid_monotonic() {
        let a = unsafe { PROC_MANAGER.alloc_pid() };
        let b = unsafe { PROC_MANAGER.alloc_pid() };
        let c = unsafe { PROC_MANAGER.alloc_pid() };
        assert!(0 < a && a < b && b < c);
    }

    /// 注册表遍历（claim 路径）与 dump 不崩；
    /// 此刻表里至少有 init 进程，且每个 claim 都配了 stop_watching
    pub fn registry_scan() {
        let n = unsafe { PROC_MANAGER.list_len() };
        assert!(n >= 1);

        let mut seen = 0;
        for i in 0..n {
            if let Some(p) = unsafe { PROC_MANAGER.claim_proc(i) } {
                assert!(unsafe { (*p).watching.load(Ordering::SeqCst) } >= 1);
                seen += 1;
                unsafe { PROC_MANAGER.stop_watching(p); }
            }
        }
        assert!(seen >= 1);

        unsafe { PROC_MANAGER.procdump(); }
    }
}
