//! 进程记录与进程自身视角的状态操作（fork、sleep、yield 等）

use array_macro::array;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::{Cell, UnsafeCell};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::consts::{fs::NFILE, PGSIZE};
use crate::fs::{File, Inode};
use crate::mm::{PageTable, RawPage, RawSinglePage};
use crate::register::{satp, sepc};
use crate::spinlock::{SpinLock, SpinLockGuard};
use crate::trap::user_trap;

use super::cpu::CPU_MANAGER;
use super::{fork_ret, Context, TrapFrame, PROC_MANAGER};

/// 进程生命周期状态
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ProcState {
    /// 记录未投入使用（已回收或正在回收）
    UNUSED,
    /// 已由 allocproc 建好骨架，尚未准备好运行
    USED,
    /// 睡在某个通道上，等待唤醒
    SLEEPING,
    /// 就绪，等调度器挑中
    RUNNABLE,
    /// 正在某个 hart 上运行
    RUNNING,
    /// 已退出，等父进程 wait 收尸
    ZOMBIE,
}

/// 进程的排他状态，由进程自己的自旋锁保护。
///
/// 状态、睡眠通道、pid 与退出码的读写都必须持锁，
/// 这把锁同时是"进程归哪个 hart 所有"的令牌。
pub struct ProcExcl {
    /// 生命周期状态
    pub state: ProcState,
    /// 睡眠通道；0 表示未睡
    pub channel: usize,
    /// 进程号，正整数
    pub pid: usize,
    /// 退出码，父进程经 wait 取走
    pub exit_status: i32,
}

impl ProcExcl {
    const fn new() -> Self {
        Self {
            state: ProcState::UNUSED,
            channel: 0,
            pid: 0,
            exit_status: 0,
        }
    }

    /// 回收前清空，让仍持有指针的观察者看到 UNUSED 而跳过
    pub fn cleanup(&mut self) {
        self.pid = 0;
        self.channel = 0;
        self.exit_status = 0;
        self.state = ProcState::UNUSED;
    }
}

/// 进程私有数据。
///
/// 只有进程自己运行时，或者持有该进程 excl 锁做初始化的
/// 另一个进程（fork）、回收它的 hart（freeproc）会访问。
pub struct ProcData {
    /// 内核栈虚拟地址，0 表示尚未映射
    kstack: usize,
    /// 用户地址空间的字节数
    pub sz: usize,
    /// 上下文，swtch 的保存区
    context: Context,
    /// 进程名，调试用
    name: [u8; 16],
    /// 打开的文件表
    pub open_files: [Option<Arc<File>>; NFILE],
    /// 当前工作目录
    pub cwd: Option<Inode>,
    /// 陷阱帧页
    pub tf: *mut TrapFrame,
    /// 用户页表
    pub pagetable: Option<Box<PageTable>>,
    /// 在进程注册表里的下标，-1 表示不在表中
    pub list_index: isize,
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: 0,
            sz: 0,
            context: Context::new(),
            name: [0; 16],
            open_files: array![_ => None; NFILE],
            cwd: None,
            tf: ptr::null_mut(),
            pagetable: None,
            list_index: -1,
        }
    }

    #[inline]
    pub fn set_kstack(&mut self, kstack: usize) {
        self.kstack = kstack;
    }

    #[inline]
    pub fn kstack(&self) -> usize {
        self.kstack
    }

    /// 配置新进程的上下文：第一次被调度时从 fork_ret "返回"，
    /// 栈指针指向内核栈顶
    pub fn init_context(&mut self) {
        self.context.clear();
        self.context.set_ra(fork_ret as *const () as usize);
        self.context.set_sp(self.kstack + PGSIZE);
    }

    pub fn get_context(&mut self) -> *mut Context {
        &mut self.context as *mut _
    }

    /// 设置进程名
    pub fn set_name(&mut self, name: &[u8]) {
        debug_assert!(name.len() <= self.name.len());
        self.name[..name.len()].copy_from_slice(name);
    }

    pub fn name(&self) -> &[u8] {
        let len = self.name.iter().position(|b| *b == 0).unwrap_or(self.name.len());
        &self.name[..len]
    }

    /// 为回到用户态准备陷阱帧，返回用户页表的 satp 值。
    ///
    /// # 流程解释
    /// 1. 把内核页表、内核栈顶、user_trap 入口和 hartid 写进陷阱帧，
    ///    下次陷入时 trampoline 用它们切回内核；
    /// 2. 把陷阱帧里保存的用户 pc 写回 sepc；
    /// 3. 返回 satp，供 userret 切地址空间。
    pub fn user_ret_prepare(&mut self) -> usize {
        let tf: &mut TrapFrame = unsafe { self.tf.as_mut().unwrap() };
        tf.kernel_satp = satp::read();
        tf.kernel_sp = self.kstack + PGSIZE;
        tf.kernel_trap = user_trap as usize;
        tf.kernel_hartid = unsafe { super::cpu::CpuManager::cpu_id() };

        sepc::write(tf.epc);

        self.pagetable.as_ref().unwrap().as_satp()
    }

    /// 把内核缓冲区 src 的 count 字节复制到用户虚拟地址 dst
    #[inline]
    pub fn copy_out(&mut self, src: *const u8, dst: usize, count: usize) -> Result<(), ()> {
        self.pagetable.as_mut().unwrap().copy_out(src, dst, count)
    }

    /// 把用户虚拟地址 src 的 count 字节复制到内核缓冲区 dst
    #[inline]
    pub fn copy_in(&self, src: usize, dst: *mut u8, count: usize) -> Result<(), ()> {
        self.pagetable.as_ref().unwrap().copy_in(src, dst, count)
    }

    /// 释放挂在进程身上的内存资源：陷阱帧页与整个用户页表。
    /// 内核栈的回收牵涉内核页表与地址提供器，由 freeproc 负责。
    pub fn cleanup(&mut self) {
        self.name[0] = 0;
        let tf = self.tf;
        self.tf = ptr::null_mut();
        if !tf.is_null() {
            unsafe { RawSinglePage::from_raw_and_drop(tf as *mut u8); }
        }
        let pgt = self.pagetable.take();
        if let Some(mut pgt) = pgt {
            pgt.dealloc_proc_pagetable(self.sz);
        }
        self.sz = 0;
    }

    /// 关闭全部打开的文件并交还 cwd。exit 路径调用。
    pub fn close_files(&mut self) {
        for f in self.open_files.iter_mut() {
            drop(f.take())
        }
        debug_assert!(self.cwd.is_some());
        drop(self.cwd.take());
    }

    /// 按 increment 伸缩用户堆，返回调整前的大小。
    /// 增长失败返回 `Err`，用户空间保持原样。
    pub fn sbrk(&mut self, increment: i32) -> Result<usize, ()> {
        let old_size = self.sz;
        if increment > 0 {
            let new_size = old_size + (increment as usize);
            self.pagetable.as_mut().unwrap().uvm_alloc(old_size, new_size)?;
            self.sz = new_size;
        } else if increment < 0 {
            let new_size = old_size - ((-increment) as usize);
            self.pagetable.as_mut().unwrap().uvm_dealloc(old_size, new_size);
            self.sz = new_size;
        }
        Ok(old_size)
    }
}

/// 进程记录。
///
/// 记录本身从伙伴分配器整块分出，地址在生命周期内不变，
/// 注册表和各个 hart 都以裸指针引用它。销毁走延迟回收：
/// freeproc 把记录推进待回收池，等所有观察者的 watching
/// 归零后才真正还给分配器。
pub struct Proc {
    /// 排他状态
    pub excl: SpinLock<ProcExcl>,
    /// 私有数据
    pub data: UnsafeCell<ProcData>,
    /// 被 kill 标记，陷阱返回路径上检查
    pub killed: AtomicBool,
    /// 正有多少 hart 经 claim 持有指向本记录的指针。
    /// 非零期间记录不得还给分配器。
    pub watching: AtomicUsize,
    /// 父进程。只在持有 wait_lock 时读写——
    /// reparent 改这里时不拿子进程的 excl 锁，靠的就是这条不变式。
    parent: Cell<*mut Proc>,
}

impl Proc {
    pub fn new(pid: usize) -> Self {
        let mut excl = ProcExcl::new();
        excl.pid = pid;
        excl.state = ProcState::USED;
        Self {
            excl: SpinLock::new(excl, "p_lock"),
            data: UnsafeCell::new(ProcData::new()),
            killed: AtomicBool::new(false),
            watching: AtomicUsize::new(0),
            parent: Cell::new(ptr::null_mut()),
        }
    }

    /// 读父进程指针。调用者必须持有 wait_lock。
    #[inline]
    pub fn parent_ptr(&self) -> *mut Proc {
        self.parent.get()
    }

    /// 写父进程指针。调用者必须持有 wait_lock。
    #[inline]
    pub fn set_parent_raw(&self, parent: *mut Proc) {
        self.parent.set(parent);
    }

    /// killed 标记置位则立刻退出
    pub fn check_abondon(&mut self, exit_status: i32) {
        if self.killed.load(Ordering::Relaxed) {
            unsafe { PROC_MANAGER.exiting(self, exit_status); }
        }
    }

    /// 置 killed 标记并退出
    pub fn abondon(&mut self, exit_status: i32) -> ! {
        self.killed.store(true, Ordering::Relaxed);
        unsafe { PROC_MANAGER.exiting(self, exit_status); }
    }

    /// 让出 CPU：RUNNING -> RUNNABLE，切回调度器。
    /// 时钟中断与主动让路都走这里。
    pub fn yielding(&mut self) {
        let mut guard = self.excl.lock();
        assert_eq!(guard.state, ProcState::RUNNING);
        guard.state = ProcState::RUNNABLE;
        guard = unsafe {
            CPU_MANAGER.my_cpu_mut().sched(guard,
                self.data.get_mut().get_context())
        };
        drop(guard);
    }

    /// 原子地放开 guard 并睡到 channel 上。
    ///
    /// # 流程解释
    /// 1. 先拿自己的 excl 锁再放 guard。wakeup 检查进程状态前
    ///    也要拿 excl 锁，所以从放开 guard 到真正睡着之间的唤醒
    ///    不会丢：唤醒者要么看到我们已是 SLEEPING（翻状态），
    ///    要么被我们的 excl 锁挡住。
    /// 2. 记下通道、置 SLEEPING，切回调度器；
    /// 3. 醒来后清通道、放 excl 锁。唤醒后不重取 guard，
    ///    调用者需要时自己重新加锁并重验条件。
    ///
    /// # 参数
    /// - `channel`: 睡眠通道；
    /// - `guard`: 调用者持有的条件锁，不能是本进程的 excl 锁。
    pub fn sleep<T>(&self, channel: usize, guard: SpinLockGuard<'_, T>) {
        let mut excl_guard = self.excl.lock();
        drop(guard);

        // 进入睡眠
        excl_guard.channel = channel;
        excl_guard.state = ProcState::SLEEPING;

        unsafe {
            let c = CPU_MANAGER.my_cpu_mut();
            excl_guard = c.sched(excl_guard,
                &mut (*self.data.get()).context as *mut _);
        }

        excl_guard.channel = 0;
        drop(excl_guard);
    }

    /// 创建子进程。
    ///
    /// # 流程解释
    /// 1. 经进程管理器分出一个新记录（含内核栈、陷阱帧、页表、注册表槽位）；
    /// 2. 深拷贝用户内存，失败则整个撤销并返回 `Err`；
    /// 3. 陷阱帧原样复制，只把子进程的 a0 改成 0（fork 在子进程返回 0）；
    /// 4. 文件表逐项 dup（Arc 克隆），cwd 同样；
    /// 5. 在 wait_lock 下挂父链，最后置 RUNNABLE。
    ///
    /// # 返回值
    /// 成功返回子进程 pid；记录或内存分配失败返回 `Err(())`。
    pub fn fork(&mut self) -> Result<usize, ()> {
        let pdata = self.data.get_mut();
        let child = unsafe { PROC_MANAGER.alloc_proc().ok_or(())? };
        let cdata = unsafe { (*child).data.get().as_mut().unwrap() };

        // 克隆用户内存
        let size = pdata.sz;
        let cpgt = cdata.pagetable.as_mut().unwrap();
        if pdata.pagetable.as_mut().unwrap().uvm_copy(cpgt, size).is_err() {
            unsafe { PROC_MANAGER.free_proc(child, (*child).excl.lock()); }
            return Err(())
        }
        cdata.sz = size;

        // 克隆陷阱帧，子进程的 fork 返回值是 0
        unsafe {
            ptr::copy_nonoverlapping(pdata.tf, cdata.tf, 1);
            cdata.tf.as_mut().unwrap().a0 = 0;
        }

        // dup 打开的文件与 cwd
        cdata.open_files.clone_from(&pdata.open_files);
        cdata.cwd.clone_from(&pdata.cwd);

        cdata.name.copy_from_slice(&pdata.name);

        let cpid = unsafe { (*child).excl.lock().pid };

        unsafe { PROC_MANAGER.set_parent(child, self as *mut Proc); }

        let mut cexcl = unsafe { (*child).excl.lock() };
        cexcl.state = ProcState::RUNNABLE;
        drop(cexcl);

        Ok(cpid)
    }
}
