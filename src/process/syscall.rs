//! 系统调用分发
//!
//! 只挂了进程核心对外提供的那组调用：进程生命周期
//! （fork/exit/wait/kill/getpid）、内存（sbrk/havemem）、
//! 时钟（sleep/uptime）和现成文件句柄上的读写/关闭。
//! open/exec/pipe 等依赖磁盘文件系统的调用在本内核边界之外。

use crate::consts::fs::NFILE;
use crate::mm::{Address, KERNEL_HEAP};
use crate::register::sstatus;
use crate::trap;

use super::{Proc, PROC_MANAGER};

pub const SYS_FORK: usize = 1;
pub const SYS_EXIT: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_READ: usize = 5;
pub const SYS_KILL: usize = 6;
pub const SYS_GETPID: usize = 11;
pub const SYS_SBRK: usize = 12;
pub const SYS_SLEEP: usize = 13;
pub const SYS_UPTIME: usize = 14;
pub const SYS_WRITE: usize = 16;
pub const SYS_CLOSE: usize = 21;
pub const SYS_HAVEMEM: usize = 22;

impl Proc {
    /// 处理当前进程发起的系统调用。
    ///
    /// 调用号在 a7，结果写回 a0（失败统一是 -1）。
    /// epc 先跳过 ecall 指令本身，sleep 等会阻塞的调用
    /// 返回后才不会重复触发。
    ///
    /// # Panics
    /// 未知调用号 panic。
    pub fn syscall(&mut self) {
        sstatus::intr_on();

        let tf = unsafe { self.data.get_mut().tf.as_mut().unwrap() };
        let a7 = tf.a7;
        tf.admit_ecall();
        let sys_result = match a7 {
            SYS_FORK => self.sys_fork(),
            SYS_EXIT => self.sys_exit(),
            SYS_WAIT => self.sys_wait(),
            SYS_READ => self.sys_read(),
            SYS_KILL => self.sys_kill(),
            SYS_GETPID => self.sys_getpid(),
            SYS_SBRK => self.sys_sbrk(),
            SYS_SLEEP => self.sys_sleep(),
            SYS_UPTIME => self.sys_uptime(),
            SYS_WRITE => self.sys_write(),
            SYS_CLOSE => self.sys_close(),
            SYS_HAVEMEM => self.sys_havemem(),
            _ => {
                panic!("unknown syscall num: {}", a7);
            }
        };
        let a0 = match sys_result {
            Ok(ret) => ret,
            Err(()) => -1isize as usize,
        };
        #[cfg(feature = "trace_syscall")]
        println!("syscall {}: a0={:#x}", a7, a0);
        let tf = unsafe { self.data.get_mut().tf.as_mut().unwrap() };
        tf.a0 = a0;
    }

    /// fork() -> 子进程 pid
    fn sys_fork(&mut self) -> Result<usize, ()> {
        self.fork()
    }

    /// exit(status)，不返回
    fn sys_exit(&mut self) -> Result<usize, ()> {
        let exit_status = self.arg_i32(0);
        unsafe { PROC_MANAGER.exiting(self, exit_status) }
    }

    /// wait(status_ptr) -> 已退出子进程的 pid
    fn sys_wait(&mut self) -> Result<usize, ()> {
        let addr = self.arg_addr(0);
        unsafe { PROC_MANAGER.waiting(addr) }
    }

    /// kill(pid) -> 0|-1
    fn sys_kill(&mut self) -> Result<usize, ()> {
        let pid = self.arg_raw(0);
        unsafe { PROC_MANAGER.kill(pid).map(|()| 0) }
    }

    /// getpid() -> pid
    fn sys_getpid(&mut self) -> Result<usize, ()> {
        Ok(self.excl.lock().pid)
    }

    /// sbrk(delta) -> 调整前的用户空间大小
    fn sys_sbrk(&mut self) -> Result<usize, ()> {
        let increment = self.arg_i32(0);
        self.data.get_mut().sbrk(increment)
    }

    /// sleep(ticks) -> 0；睡眠中被 kill 返回 -1
    fn sys_sleep(&mut self) -> Result<usize, ()> {
        let count = self.arg_raw(0);
        trap::clock_sleep(self, count).map(|()| 0)
    }

    /// uptime() -> 启动以来的时钟滴答数
    fn sys_uptime(&mut self) -> Result<usize, ()> {
        Ok(trap::clock_read())
    }

    /// read(fd, buf, count) -> 实际读到的字节数
    fn sys_read(&mut self) -> Result<usize, ()> {
        let fd = self.arg_fd(0)?;
        let addr = self.arg_addr(1);
        let count = self.arg_raw(2);
        let file = self.data.get_mut().open_files[fd].as_ref().unwrap().clone();
        file.read(Address::Virtual(addr), count as u32).map(|n| n as usize)
    }

    /// write(fd, buf, count) -> 实际写出的字节数
    fn sys_write(&mut self) -> Result<usize, ()> {
        let fd = self.arg_fd(0)?;
        let addr = self.arg_addr(1);
        let count = self.arg_raw(2);
        let file = self.data.get_mut().open_files[fd].as_ref().unwrap().clone();
        file.write(Address::Virtual(addr), count as u32).map(|n| n as usize)
    }

    /// close(fd) -> 0
    fn sys_close(&mut self) -> Result<usize, ()> {
        let fd = self.arg_fd(0)?;
        drop(self.data.get_mut().open_files[fd].take());
        Ok(0)
    }

    /// havemem() -> 伙伴分配器当前的空闲字节数
    fn sys_havemem(&mut self) -> Result<usize, ()> {
        Ok(KERNEL_HEAP.have_mem())
    }
}

impl Proc {
    /// 第 n 个系统调用参数的原始值，参数经 a0..a5 传递
    fn arg_raw(&self, n: usize) -> usize {
        let tf = unsafe { self.data.get().as_ref().unwrap().tf.as_ref().unwrap() };
        match n {
            0 => tf.a0,
            1 => tf.a1,
            2 => tf.a2,
            3 => tf.a3,
            4 => tf.a4,
            5 => tf.a5,
            _ => panic!("arg_raw: n is larger than 5"),
        }
    }

    /// 按 32 位有符号整数取参数
    #[inline]
    fn arg_i32(&self, n: usize) -> i32 {
        self.arg_raw(n) as i32
    }

    /// 按用户虚拟地址取参数。地址可能是空的，
    /// 合法性到页表拷贝时才检查。
    #[inline]
    fn arg_addr(&self, n: usize) -> usize {
        self.arg_raw(n)
    }

    /// 按文件描述符取参数，检查范围且确实打开着
    #[inline]
    fn arg_fd(&mut self, n: usize) -> Result<usize, ()> {
        let fd = self.arg_raw(n);
        if fd >= NFILE || self.data.get_mut().open_files[fd].is_none() {
            Err(())
        } else {
            Ok(fd)
        }
    }
}
