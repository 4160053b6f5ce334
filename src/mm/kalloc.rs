//! 内核物理内存分配器，采用伙伴算法
//!
//! 与按块记录分配标志的常见写法不同，这里每对伙伴只存一个
//! allocated-xor 位：两个伙伴分配标志的异或。释放一侧后只要读一次
//! 该位就能回答"能否合并"（位为 0 即两侧都空闲），位图也减半。

use core::alloc::{GlobalAlloc, Layout};
use core::cmp;
use core::mem::{size_of, MaybeUninit};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::consts::{LEAF_SIZE, PGSIZE};
use crate::spinlock::SpinLock;
use super::bitset;
use super::freelist::FreeList;

/// 全局内核堆分配器。
///
/// 通过 `#[global_allocator]` 接管内核里所有 `Box`/`Arc` 等堆分配请求，
/// 内部是一个自旋锁保护的伙伴系统。
/// hart 0 在启动早期用设备树给出的堆底调用 [`KernelHeap::kinit`]，
/// 此前不允许任何堆分配。
#[global_allocator]
pub static KERNEL_HEAP: KernelHeap = KernelHeap::uninit();

/// 当前空闲字节数。
///
/// 放在锁外、用原子加减维护，这样 `have_mem` 不必排队等分配器的锁。
static FREE_MEM: AtomicUsize = AtomicUsize::new(0);

#[alloc_error_handler]
fn foo(layout: Layout) -> ! {
    panic!("alloc error: {:?}", layout)
}

/// 内核堆分配器封装，向外提供线程安全的分配/回收
pub struct KernelHeap(SpinLock<BuddySystem>);

impl KernelHeap {
    const fn uninit() -> Self {
        Self(SpinLock::new(BuddySystem::uninit(), "kernel heap"))
    }

    /// 初始化内核堆。
    ///
    /// # 功能说明
    /// 把 `[base, end)` 的物理内存交给伙伴系统管理。
    /// `base` 由设备树读取器算出（内核镜像、固件保留区与设备树本体
    /// 三者之上取最大再页对齐），`end` 是物理内存上限 `PHYSTOP`。
    ///
    /// # 安全性
    /// - 只能由 hart 0 在启动时调用一次；
    /// - 调用前不得有任何堆分配（`Box`、`Vec` 等）。
    pub unsafe fn kinit(&self, base: usize, end: usize) {
        println!("KernelHeap: available physical memory [{:#x}, {:#x})", base, end);
        self.0.lock().init(base, end);
        println!("KernelHeap: init memory done");
    }

    /// 当前空闲字节数。
    /// 只读一个原子计数器，不取分配器的锁，所以读到的值可能
    /// 瞬间就被其它 hart 的分配改变，只能当作参考值。
    #[inline]
    pub fn have_mem(&self) -> usize {
        FREE_MEM.load(Ordering::Relaxed)
    }
}

/// `GlobalAlloc` 接口：加锁转发给内部伙伴系统。
/// `alloc` 失败（内存耗尽）时按约定返回空指针，由调用方处理。
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.0.lock().alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.0.lock().dealloc(ptr, layout)
    }
}

/// 伙伴系统分配器。
///
/// 管理 `[base, base + 2^max_size * LEAF_SIZE)` 这一段连续物理内存，
/// 块大小都是 `2^k * LEAF_SIZE`。每个大小等级记录一个空闲链表、
/// 一张按伙伴对索引的 allocated-xor 位图，以及（k >= 1 时）一张按块
/// 索引的 split 位图。元数据本身放在被管理内存的最低处并标为已分配。
pub struct BuddySystem {
    /// 管理区间的起始物理地址（页对齐）
    base: usize,

    /// 实际可用内存的结束地址（页对齐）。
    /// 从这里到 2 的幂上界之间的部分标为永久占用。
    actual_end: usize,

    /// 大小等级数，等级 k 的块大小为 `2^k * LEAF_SIZE`
    nsizes: usize,

    /// 防止重复初始化
    initialized: bool,

    /// 每个大小等级的链表与位图，指向元数据区内手工构造的切片
    infos: MaybeUninit<*mut [LevelInfo]>,
}

// *mut [T] 不是 Send，这里的裸指针只在锁内使用
unsafe impl Send for BuddySystem {}

impl BuddySystem {
    const fn uninit() -> Self {
        Self {
            base: 0,
            actual_end: 0,
            nsizes: 0,
            initialized: false,
            infos: MaybeUninit::uninit(),
        }
    }

    /// 初始化伙伴系统。
    ///
    /// # 功能说明
    /// - 把 `[start, end)` 页对齐后作为管理区间；
    /// - 按区间大小确定等级数 `nsizes`，在区间最低处铺设每级的
    ///   `LevelInfo`、allocated-xor 位图和 split 位图；
    /// - 把元数据前缀和为凑成 2 的幂而多出的尾部标为已分配；
    /// - 扫描两处边界伙伴对，把真正可用的块挂进空闲链表；
    /// - 核对"元数据 + 不可用 + 空闲 = 总量"这一恒等式，不满足即 panic。
    ///
    /// # 参数
    /// - `start`: 管理区间起始物理地址（可以不对齐）；
    /// - `end`: 管理区间结束物理地址（不含）。
    ///
    /// # 可能的错误
    /// - 重复初始化 panic：`buddy system: init twice`；
    /// - 恒等式不成立 panic 并打印 meta/free/unavail 三项。
    ///
    /// # 安全性
    /// 调用者保证 `[start, end)` 是本内核独占的、可读写的物理内存。
    unsafe fn init(&mut self, start: usize, end: usize) {
        if self.initialized {
            panic!("  buddy system: init twice");
        }

        // 区间两端页对齐，记录管理范围
        let mut cur: usize = round_up(start, cmp::max(LEAF_SIZE, PGSIZE));
        self.base = cur;
        self.actual_end = round_down(end, cmp::max(LEAF_SIZE, PGSIZE));

        // 等级数：能覆盖区间的最小 2 的幂
        self.nsizes = log2((self.actual_end - cur) / LEAF_SIZE) + 1;
        if self.actual_end - cur > blk_size(self.max_size()) {
            self.nsizes += 1;
        }

        println!("  buddy system: useful memory is {:#x} bytes", self.actual_end - self.base);
        println!("  buddy system: leaf size is {} bytes", LEAF_SIZE);
        println!("  buddy system: free lists have {} different sizes", self.nsizes);

        // 在区间低端铺设每级的 LevelInfo
        let info_slice_ptr = init_slice_empty(&mut cur, self.nsizes);
        self.infos.as_mut_ptr().write(info_slice_ptr);

        // 初始化空闲链表，铺设 allocated-xor 位图。
        // 位图按伙伴对索引，所以容量是块数的一半；顶层只有一个块，
        // 没有成对的伙伴，但仍保留一个字节放它的标志。
        for i in 0..self.nsizes {
            let nblk = self.n_blk(i);
            let info = self.get_info_mut(i);

            info.free.init();

            let mut xor_size = round_up(nblk, 8) / 16;
            if xor_size == 0 {
                xor_size = 1;
            }
            let xor_slice_ptr = init_slice_empty(&mut cur, xor_size);
            info.alloc_xor.as_mut_ptr().write(xor_slice_ptr);
        }

        // 铺设 split 位图；等级 0 的块不可再分，没有 split 位图
        for i in 1..self.nsizes {
            let nblk = self.n_blk(i);
            let info = self.get_info_mut(i);

            let split_size = round_up(nblk, 8) / 8;
            let split_slice_ptr = init_slice_empty(&mut cur, split_size);
            info.split.as_mut_ptr().write(split_slice_ptr);
        }

        cur = round_up(cur, LEAF_SIZE);

        // 元数据占据 [base, cur)
        let meta = self.mark_meta(cur);

        // 实际内存不足 2 的幂，[actual_end, base + 2^max_size * LEAF_SIZE) 不可用
        let unavail = self.mark_unavail();

        // 把剩余内存挂进空闲链表
        let free = self.init_free(cur);
        FREE_MEM.store(free, Ordering::Relaxed);

        // 总量核对
        if free != blk_size(self.max_size()) - meta - unavail {
            panic!("  buddy system: meta {}, free {}, unavail {}", meta, free, unavail);
        }

        self.initialized = true;
    }

    /// 分配一个满足 `layout` 的内存块。
    ///
    /// # 功能说明
    /// - 取大小与对齐的较大者，算出能容纳它的最小等级 `smalli`；
    /// - 自 `smalli` 向上找第一个非空的空闲链表，没有则返回空指针；
    /// - 弹出块并翻转它的 allocated-xor 位，逐级劈开到 `smalli`，
    ///   每次劈开把右伙伴挂回低一级的空闲链表；
    /// - 空闲计数按最终交出的块大小原子递减。
    ///
    /// # 返回值
    /// 成功返回块首指针；内存耗尽返回 `null_mut()`。
    ///
    /// # 可能的错误
    /// 对齐要求超过页大小时 panic（伙伴块天然按自身大小对齐，
    /// 页以内的对齐总能满足）。
    fn alloc(&mut self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            return ptr::null_mut()
        }

        if layout.align() > PGSIZE {
            panic!("  buddy system: request layout alignment({}) bigger than PGSIZE({})",
                layout.align(), PGSIZE);
        }

        // 块按自身大小自然对齐，取 size 与 align 的较大者即可同时满足两者
        let need = cmp::max(layout.size(), layout.align());
        let smalli = if need <= LEAF_SIZE {
            0
        } else {
            (need.next_power_of_two() / LEAF_SIZE).trailing_zeros() as usize
        };
        let mut sizei = smalli;
        while sizei < self.nsizes {
            let info = unsafe { self.get_info_mut(sizei) };
            if !info.free.is_empty() {
                break;
            }
            sizei += 1;
        }
        if sizei >= self.nsizes {
            // 没有空闲内存
            return ptr::null_mut()
        }

        FREE_MEM.fetch_sub(blk_size(smalli), Ordering::Relaxed);

        // 从等级 sizei 弹出一个块并记为已分配
        let raw_addr = unsafe { self.get_info_mut(sizei).free.pop() };
        let pairi = self.blk_index(sizei, raw_addr) >> 1;
        unsafe { self.get_info_mut(sizei).alloc_xor_invert(pairi); }

        // 逐级劈开到目标等级
        while sizei > smalli {
            // 本级标记已分裂
            let bi = self.blk_index(sizei, raw_addr);
            let info = unsafe { self.get_info_mut(sizei) };
            info.split_set(bi, true);

            // 低一级：左子块分配出去，右伙伴挂回空闲链表
            let pairi1 = self.blk_index(sizei - 1, raw_addr) >> 1;
            let buddy_addr = raw_addr + blk_size(sizei - 1);
            let info1 = unsafe { self.get_info_mut(sizei - 1) };
            unsafe {
                info1.alloc_xor_invert(pairi1);
                info1.free.push(buddy_addr);
            }

            sizei -= 1;
        }

        raw_addr as *mut u8
    }

    /// 释放 `alloc` 返回的内存块并尽可能向上合并。
    ///
    /// # 功能说明
    /// - 块的等级不由 `layout` 给出，而是从等级 1 起向上扫 split 位：
    ///   包含该地址的块第一次出现"未分裂"的等级就是它被交出的等级；
    /// - 翻转本块的 allocated-xor 位；翻转后该位仍为 1 说明伙伴还在用，
    ///   合并到此为止；为 0 则把伙伴从空闲链表摘下、清父块 split 位，
    ///   升一级继续；
    /// - 最终的（可能已多级合并的）块挂回对应链表；
    /// - 空闲计数按回收块的大小原子递增，每次释放恰好加一次。
    ///
    /// # 可能的错误
    /// - `ptr` 不在管理区间内 panic：`dealloc ptr out of range`；
    /// - 扫不到块的等级 panic：`dealloc cannot recycle ptr`；
    /// - `layout.size()` 大于块大小 panic，说明释放参数与分配不符。
    ///
    /// # 安全性
    /// `ptr` 必须来自本分配器且未被释放过，否则位图会被搅乱。
    fn dealloc(&mut self, ptr: *mut u8, layout: Layout) {
        let mut raw_addr = ptr as usize;
        if raw_addr < self.base || raw_addr >= self.actual_end {
            panic!("  buddy system: dealloc ptr out of range");
        }

        // 从 split 位恢复块的等级
        let mut sizei = self.nsizes;
        for i in 0..self.max_size() {
            let bi = self.blk_index(i + 1, raw_addr);
            let info = unsafe { self.get_info_mut(i + 1) };
            if info.is_split_set(bi) {
                sizei = i;
                break;
            }
        }
        if sizei == self.nsizes {
            panic!("  buddy system: dealloc cannot recycle ptr");
        }

        if layout.size() > blk_size(sizei) {
            panic!("  buddy system: layout {:?} > blk size {}", layout, blk_size(sizei));
        }

        FREE_MEM.fetch_add(blk_size(sizei), Ordering::Relaxed);

        // 释放并逐级合并
        while sizei < self.max_size() {
            let bi = self.blk_index(sizei, raw_addr);
            let buddyi = bi ^ 1;
            let info = unsafe { self.get_info_mut(sizei) };
            unsafe { info.alloc_xor_invert(bi >> 1); }

            // 翻转后位为 1：恰有一侧（即伙伴）仍被占用，停止合并
            if unsafe { info.is_alloc_xor_set(bi >> 1) } {
                break;
            }
            let buddy_addr = self.blk_addr(sizei, buddyi);
            unsafe { FreeList::unlink_block(buddy_addr); }
            if buddyi & 1 == 0 {
                // 向上合并后块首要落在伙伴对的低地址一侧
                raw_addr = buddy_addr;
            }

            sizei += 1;
            let spliti = self.blk_index(sizei, raw_addr);
            let info = unsafe { self.get_info_mut(sizei) };
            info.split_set(spliti, false);
        }

        let info = unsafe { self.get_info_mut(sizei) };
        unsafe { info.free.push(raw_addr); }
    }

    /// 把元数据区 `[base, cur)` 标记为已分配，返回元数据字节数
    fn mark_meta(&mut self, cur: usize) -> usize {
        let meta = cur - self.base;
        println!("  buddy system: alloc {:#x} bytes meta data", meta);
        self.mark(self.base, cur);
        meta
    }

    /// 把凑 2 的幂多出的尾部 `[actual_end, base + 2^max_size * LEAF_SIZE)`
    /// 标记为已分配，返回不可用字节数
    fn mark_unavail(&mut self) -> usize {
        let unavail = blk_size(self.max_size()) - (self.actual_end - self.base);
        println!("  buddy system: {:#x} bytes unavailable", unavail);
        self.mark(self.actual_end, self.actual_end + unavail);
        unavail
    }

    /// 把 `[left, right)` 在所有等级上标记为已分配。
    ///
    /// 每个被覆盖的块翻转一次所在伙伴对的 allocated-xor 位
    /// （一对里两块都被覆盖时位经两次翻转回到 0，正好表示"两侧状态一致"），
    /// 等级大于 0 的块同时置 split 位，阻止之后的合并越过该区域。
    fn mark(&mut self, left: usize, right: usize) {
        assert_eq!(left % LEAF_SIZE, 0);
        assert_eq!(right % LEAF_SIZE, 0);

        for i in 0..self.nsizes {
            let mut bi = self.blk_index(i, left);
            let bj = self.blk_index_next(i, right);
            while bi < bj {
                let info = unsafe { self.get_info_mut(i) };

                if i > 0 {
                    info.split_set(bi, true);
                }
                unsafe { info.alloc_xor_invert(bi >> 1); }
                bi += 1;
            }
        }
    }

    /// 为每个等级把边界上真正空闲的块挂进空闲链表，返回空闲总字节数。
    ///
    /// 标记阶段结束后，只有两处可能出现"一侧占用一侧空闲"的伙伴对：
    /// 紧挨元数据前缀的一对和紧挨不可用尾部的一对。内部的块要么整对
    /// 空闲（由上一级整体代表），要么整对占用，不需要单独入链。
    fn init_free(&mut self, left: usize) -> usize {
        let right = self.actual_end;
        let mut free = 0;
        for i in 0..self.max_size() {
            let lbi = self.blk_index_next(i, left);
            let rbi = self.blk_index(i, right);
            free += self.init_free_pair(i, lbi, true);
            // rbi 越过本级最后一块说明没有不可用尾部，右边界没有要补的对
            if rbi <= lbi || rbi >= self.n_blk(i) {
                continue;
            }
            free += self.init_free_pair(i, rbi, false);
        }
        free
    }

    /// 处理一个边界伙伴对。
    ///
    /// allocated-xor 位只说明"恰有一侧被占用"，无法区分是哪一侧，
    /// 由边界的几何关系补全：低索引方向是元数据前缀、高索引方向是
    /// 不可用尾部，所以空闲的一定是位于可用一侧的那块——
    /// 前缀边界取编号大的，尾部边界取编号小的。
    ///
    /// # 参数
    /// - `sizei`: 等级；
    /// - `bi`: 紧贴边界的块编号；
    /// - `prefix_side`: true 表示元数据前缀边界，false 表示不可用尾部边界。
    ///
    /// # 返回值
    /// 入链的字节数；整对状态一致时为 0。
    fn init_free_pair(&mut self, sizei: usize, bi: usize, prefix_side: bool) -> usize {
        let buddyi = bi ^ 1;
        let freei = if prefix_side {
            cmp::max(bi, buddyi)
        } else {
            cmp::min(bi, buddyi)
        };
        let free_addr = self.blk_addr(sizei, freei);

        let info = unsafe { self.get_info_mut(sizei) };
        if unsafe { info.is_alloc_xor_set(bi >> 1) } {
            unsafe { info.free.push(free_addr); }
            blk_size(sizei)
        } else {
            0
        }
    }

    /// 取某等级的伙伴信息。
    ///
    /// # 安全性
    /// 必须在 infos 初始化之后调用。
    unsafe fn get_info_mut(&mut self, index: usize) -> &mut LevelInfo {
        let info_slice_ptr = *self.infos.as_ptr();
        info_slice_ptr.get_unchecked_mut(index).as_mut().unwrap()
    }

    /// 最大等级，也是 infos 的最后一个下标
    #[inline]
    fn max_size(&self) -> usize {
        self.nsizes - 1
    }

    /// 等级 k 的块数
    #[inline]
    fn n_blk(&self, k: usize) -> usize {
        1 << (self.max_size() - k)
    }

    /// addr 所在的等级 k 块编号
    fn blk_index(&self, k: usize, addr: usize) -> usize {
        (addr - self.base) / blk_size(k)
    }

    /// 第一个不含 addr 的等级 k 块编号
    fn blk_index_next(&self, k: usize, addr: usize) -> usize {
        let mut i = (addr - self.base) / blk_size(k);
        if (addr - self.base) % blk_size(k) > 0 {
            i += 1;
        }
        i
    }

    /// 等级 k 第 bi 块的起始地址
    fn blk_addr(&self, k: usize, bi: usize) -> usize {
        self.base + (bi * blk_size(k))
    }
}

/// 单个大小等级的管理信息
#[repr(C)]
struct LevelInfo {
    /// 本等级当前空闲的块
    free: FreeList,
    /// 按伙伴对索引：两个伙伴分配标志的异或
    alloc_xor: MaybeUninit<*mut [u8]>,
    /// 按块索引：该块是否被劈成了两个低一级的伙伴
    split: MaybeUninit<*mut [u8]>,
}

impl LevelInfo {
    /// 安全性：必须在 alloc_xor 初始化之后调用
    unsafe fn alloc_xor_invert(&mut self, pairi: usize) {
        bitset::invert(*self.alloc_xor.as_ptr(), pairi);
    }

    /// 安全性：必须在 alloc_xor 初始化之后调用
    unsafe fn is_alloc_xor_set(&self, pairi: usize) -> bool {
        bitset::get(*self.alloc_xor.as_ptr() as *const [u8], pairi)
    }

    fn split_set(&mut self, index: usize, set_or_clear: bool) {
        unsafe {
            if set_or_clear {
                bitset::set(*self.split.as_ptr(), index);
            } else {
                bitset::clear(*self.split.as_ptr(), index);
            }
        }
    }

    fn is_split_set(&self, index: usize) -> bool {
        unsafe { bitset::get(*self.split.as_ptr() as *const [u8], index) }
    }
}

/// 在 cur 处切出 len 个 T 并清零，cur 前移。
/// 用于在被管理内存的低端铺设分配器自身的元数据。
unsafe fn init_slice_empty<T>(cur: &mut usize, len: usize) -> *mut [T] {
    let raw_ptr = *cur as *mut T;
    *cur += size_of::<T>() * len;
    ptr::write_bytes(raw_ptr, 0, len);
    ptr::slice_from_raw_parts_mut(raw_ptr, len)
}

#[inline]
fn round_up(n: usize, size: usize) -> usize {
    (((n - 1) / size) + 1) * size
}

#[inline]
fn round_down(n: usize, size: usize) -> usize {
    (n / size) * size
}

fn log2(mut n: usize) -> usize {
    let mut k = 0;
    while n > 1 {
        k += 1;
        n >>= 1;
    }
    k
}

/// 等级 k 的块大小
#[inline]
fn blk_size(k: usize) -> usize {
    (1 << k) * LEAF_SIZE
}

#[cfg(feature = "unit_test")]
pub mod tests {
    use alloc::boxed::Box;

    use super::KERNEL_HEAP;
    use crate::mm::{RawPage, RawSinglePage};
    use crate::process::CpuManager;

    /// 多核同时分配/释放页帧，分配器不崩、页帧互不重叠
    pub fn alloc_simo() {
        let id = unsafe { CpuManager::cpu_id() };

        for i in 0..10 {
            let page = unsafe { RawSinglePage::new_zeroed() };
            // 写满自己的标记再读回，检查没有与其它 hart 的页交叠
            unsafe {
                core::ptr::write_bytes(page, id as u8 + 1, crate::consts::PGSIZE);
                assert_eq!(*page.add(i * 7), id as u8 + 1);
                RawSinglePage::from_raw_and_drop(page);
            }
        }
    }

    /// 记账恒等式：一轮大小混杂的分配全部释放后，
    /// 空闲字节数回到起点（分裂出的块全部重新合并）。
    /// 只能在其它 hart 不碰分配器时运行。
    pub fn accounting() {
        let before = KERNEL_HEAP.have_mem();

        {
            let a = Box::new([0u8; 24]);
            let b = Box::new([0u8; 300]);
            let c = Box::new([0u8; 4096]);
            let d = Box::new(1234usize);
            assert_eq!(*d, 1234);
            assert_eq!(a[0] + b[0] + c[0], 0);
        }

        assert_eq!(KERNEL_HEAP.have_mem(), before);
    }
}
