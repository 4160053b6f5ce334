//! 扁平设备树（FDT）读取器
//!
//! 内核只消费设备树的两样东西：头部（校验固件交接是否正常）和
//! 内存保留块（固件/设备树本体占据的物理内存不能交给分配器）。
//! 结构块与字符串块的完整解析属于外部协作组件，这里不做。
//!
//! 设备树整体是大端存储，读出的每个字段都要过一次 `from_be`。

use core::cmp;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::mm::pg_round_up;

/// FDT 头部魔数
pub const DEVICE_TREE_MAGIC: u32 = 0xD00D_FEED;

/// 内核支持的设备树版本
pub const DEVICE_TREE_EXPECTED_VERSION: u32 = 17;

/// 版本 17 向后兼容到的最低版本
pub const DEVICE_TREE_LAST_COMP_VERSION: u32 = 16;

/// 固件在 a1 里交来的设备树物理地址，由 `start` 在机器模式下记录。
/// 各 hart 写入的是同一个值。
static DEVICE_TREE_PTR: AtomicUsize = AtomicUsize::new(0);

/// FDT 头部。字段在内存里全部是大端，
/// [`header_at`] 读出时逐字段转成本机字节序。
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct FdtHeader {
    /// 应为 0xD00DFEED
    pub magic: u32,
    /// 设备树总大小（字节），含所有填充
    pub total_size: u32,
    /// 结构块相对头部起点的偏移
    pub offset_dt_struct: u32,
    /// 字符串块相对头部起点的偏移
    pub offset_dt_strings: u32,
    /// 内存保留块相对头部起点的偏移
    pub offset_mem_rsvmap: u32,
    /// 设备树结构版本，应为 17
    pub version: u32,
    /// 当前版本向后兼容到的最低版本，应为 16
    pub last_comp_version: u32,
    /// 启动 CPU 的物理 ID
    pub boot_cpuid_phys: u32,
    /// 字符串块字节长度
    pub size_dt_strings: u32,
    /// 结构块字节长度
    pub size_dt_struct: u32,
}

/// 记录固件交来的设备树地址。
///
/// # 安全性
/// 由 `start` 在机器模式早期调用，此时尚未开启分页。
pub fn record_device_tree_ptr(pa: usize) {
    DEVICE_TREE_PTR.store(pa, Ordering::Relaxed);
}

/// 读取并校验 ptr 处的 FDT 头部。
///
/// # 可能的错误
/// - 魔数不符 panic，并打印期望值与实际值；
/// - 版本不符 panic，同样打印两个值。
/// 两者都说明固件交接坏了，内核无法继续。
///
/// # 安全性
/// `ptr` 必须指向一段至少头部大小、可读的内存。
pub unsafe fn header_at(ptr: *const u8) -> FdtHeader {
    let mut header = ptr::read(ptr as *const FdtHeader);
    header.magic = u32::from_be(header.magic);
    header.total_size = u32::from_be(header.total_size);
    header.offset_dt_struct = u32::from_be(header.offset_dt_struct);
    header.offset_dt_strings = u32::from_be(header.offset_dt_strings);
    header.offset_mem_rsvmap = u32::from_be(header.offset_mem_rsvmap);
    header.version = u32::from_be(header.version);
    header.last_comp_version = u32::from_be(header.last_comp_version);
    header.boot_cpuid_phys = u32::from_be(header.boot_cpuid_phys);
    header.size_dt_strings = u32::from_be(header.size_dt_strings);
    header.size_dt_struct = u32::from_be(header.size_dt_struct);

    if header.magic != DEVICE_TREE_MAGIC {
        println!("Invalid device tree magic: expected {:#x}, got {:#x}",
            DEVICE_TREE_MAGIC, header.magic);
        panic!("device tree");
    }
    if header.version != DEVICE_TREE_EXPECTED_VERSION {
        println!("Unsupported device tree version: expected {}, got {}",
            DEVICE_TREE_EXPECTED_VERSION, header.version);
        panic!("device tree");
    }
    header
}

/// 扫内存保留块，返回所有保留区间的最高结束地址。
///
/// 保留块是 `{u64 地址, u64 大小}` 的大端数组，以 `{0, 0}` 结尾。
/// 没有保留区间时返回 0。
///
/// # 安全性
/// `dtb` 与 `header` 必须来自同一棵有效的设备树。
pub unsafe fn reserved_top(dtb: usize, header: &FdtHeader) -> usize {
    let mut top: usize = 0;
    let mut entry = (dtb + header.offset_mem_rsvmap as usize) as *const u64;
    loop {
        let address = u64::from_be(ptr::read(entry));
        let size = u64::from_be(ptr::read(entry.add(1)));
        if address == 0 && size == 0 {
            break;
        }
        top = cmp::max(top, (address + size) as usize);
        entry = entry.add(2);
    }
    top
}

/// 计算可交给物理内存分配器的堆底。
///
/// # 功能说明
/// 取三者的最大值再向上页对齐：
/// 1. 内核镜像结束地址（链接脚本导出的 `end`）；
/// 2. 所有固件保留区间的最高结束地址；
/// 3. 设备树本体的结束地址（`device_tree_ptr + total_size`）。
///
/// # 可能的错误
/// 头部校验失败时在 [`header_at`] 内 panic。
///
/// # 安全性
/// 只能在 `record_device_tree_ptr` 之后、开启分页之前由 hart 0 调用。
pub unsafe fn heap_base() -> usize {
    extern "C" {
        fn end();
    }
    let kernel_end = end as usize;

    let dtb = DEVICE_TREE_PTR.load(Ordering::Relaxed);
    let header = header_at(dtb as *const u8);
    println!("Device tree: got header");

    let mut base = cmp::max(kernel_end, reserved_top(dtb, &header));
    base = cmp::max(base, dtb + header.total_size as usize);
    pg_round_up(base)
}

#[cfg(feature = "unit_test")]
pub mod tests {
    use super::*;

    const fn be32(x: u32) -> [u8; 4] {
        x.to_be_bytes()
    }

    const fn be64(x: u64) -> [u8; 8] {
        x.to_be_bytes()
    }

    /// 手工拼一棵只有头部和保留块的设备树：
    /// 头部字段逐个读对、两条保留区间取到最高结束地址。
    pub fn parse_blob() {
        #[repr(C, align(8))]
        struct Blob([u8; 40 + 40]);

        static mut BLOB: Blob = Blob([0; 80]);

        let blob = unsafe { &mut *core::ptr::addr_of_mut!(BLOB.0) };
        blob[0..4].copy_from_slice(&be32(DEVICE_TREE_MAGIC));
        blob[4..8].copy_from_slice(&be32(80));          // total_size
        blob[8..12].copy_from_slice(&be32(0));          // off_dt_struct
        blob[12..16].copy_from_slice(&be32(0));         // off_dt_strings
        blob[16..20].copy_from_slice(&be32(40));        // off_mem_rsvmap
        blob[20..24].copy_from_slice(&be32(DEVICE_TREE_EXPECTED_VERSION));
        blob[24..28].copy_from_slice(&be32(DEVICE_TREE_LAST_COMP_VERSION));
        blob[28..32].copy_from_slice(&be32(0));         // boot_cpuid_phys
        blob[32..36].copy_from_slice(&be32(0));         // size_dt_strings
        blob[36..40].copy_from_slice(&be32(0));         // size_dt_struct

        // 两条保留区间：[0x1000, 0x3000) 与 [0x8000_0000, 0x8020_0000)
        blob[40..48].copy_from_slice(&be64(0x1000));
        blob[48..56].copy_from_slice(&be64(0x2000));
        blob[56..64].copy_from_slice(&be64(0x8000_0000));
        blob[64..72].copy_from_slice(&be64(0x20_0000));
        // {0, 0} 结尾已是初始值

        let base = blob.as_ptr() as usize;
        let header = unsafe { header_at(base as *const u8) };
        assert_eq!(header.magic, DEVICE_TREE_MAGIC);
        assert_eq!(header.total_size, 80);
        assert_eq!(header.offset_mem_rsvmap, 40);
        assert_eq!(header.version, DEVICE_TREE_EXPECTED_VERSION);
        assert_eq!(header.last_comp_version, DEVICE_TREE_LAST_COMP_VERSION);

        let top = unsafe { reserved_top(base, &header) };
        assert_eq!(top, 0x8020_0000);
    }
}
