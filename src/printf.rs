//! 内核格式化输出

use core::fmt;
use core::panic;
use core::sync::atomic::Ordering;

use crate::driver::{console, PANICKED};
use crate::spinlock::SpinLock;

/// 零大小的打印目标，把格式化结果逐字节送进控制台
struct Print;

impl Print {
    fn print(&self, c: u8) {
        console::putc(c);
    }
}

impl fmt::Write for Print {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.print(byte);
        }
        Ok(())
    }
}

/// 核心打印函数（宏调用）。
/// 正常状态下用自旋锁序列化多个 hart 的输出；
/// 已经 panic 时不抢锁，保证诊断信息能出来。
pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write;
    static PRINT: SpinLock<()> = SpinLock::new((), "print");

    if PANICKED.load(Ordering::Relaxed) {
        // no need to lock
        Print.write_fmt(args).expect("_print: error");
    } else {
        let guard = PRINT.lock();
        Print.write_fmt(args).expect("_print: error");
        drop(guard);
    }
}

/// 在终端输出一串字符
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::printf::_print(format_args!($($arg)*));
    };
}

/// 在终端输出一行字符
#[macro_export]
macro_rules! println {
    () => {$crate::print!("\n")};
    ($fmt:expr) => {$crate::print!(concat!($fmt, "\n"))};
    ($fmt:expr, $($arg:tt)*) => {
        $crate::print!(concat!($fmt, "\n"), $($arg)*)
    };
}

/// 全局 panic 处理：打印诊断，置 PANICKED 标志，挂起本 hart。
/// 其它 hart 的输出看到标志后会自行停住。
#[panic_handler]
fn panic(info: &panic::PanicInfo<'_>) -> ! {
    crate::println!("{}", info);
    PANICKED.store(true, Ordering::Relaxed);
    loop {}
}

#[no_mangle]
fn abort() -> ! {
    panic!("abort");
}

#[cfg(feature = "unit_test")]
pub mod tests {
    use crate::process::CpuManager;

    /// 多个 hart 同时 println，输出按行完整不串行
    pub fn println_simo() {
        let cpu_id = unsafe { CpuManager::cpu_id() };

        for i in 0..10 {
            println!("println_mul_hart{}: hart {}", i, cpu_id);
        }
    }
}
