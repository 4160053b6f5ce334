//! 页表配置与管理

use array_macro::array;

use alloc::boxed::Box;
use core::convert::TryFrom;
use core::ptr;

use crate::consts::{PGSHIFT, PGSIZE, SATP_SV39, SV39FLAGLEN, TRAMPOLINE, TRAPFRAME, USERTEXT};
use super::{pg_round_up, Addr, PhysAddr, RawPage, RawSinglePage, VirtAddr};

bitflags! {
    /// 页表项的权限与状态标志（RISC-V Sv39）
    pub struct PteFlag: usize {
        /// 有效位
        const V = 1 << 0;
        /// 可读
        const R = 1 << 1;
        /// 可写
        const W = 1 << 2;
        /// 可执行
        const X = 1 << 3;
        /// 用户态可访问
        const U = 1 << 4;
        /// 全局映射
        const G = 1 << 5;
        /// 访问过（硬件置位）
        const A = 1 << 6;
        /// 写过（硬件置位）
        const D = 1 << 7;
        /// 留给软件的两位
        const RSW = 0b11 << 8;
    }
}

/// 单个页表项：物理页号与标志位打包在一个 usize 里
#[repr(C)]
#[derive(Debug)]
pub struct PageTableEntry {
    data: usize,
}

impl PageTableEntry {
    #[inline]
    pub fn is_valid(&self) -> bool {
        (self.data & (PteFlag::V.bits())) > 0
    }

    /// R/W/X 任一置位的表项是叶子，否则指向下一级页表
    #[inline]
    fn is_leaf(&self) -> bool {
        let flag_bits = self.data & (PteFlag::R | PteFlag::W | PteFlag::X).bits();
        !(flag_bits == 0)
    }

    #[inline]
    fn is_user(&self) -> bool {
        (self.data & (PteFlag::U.bits())) > 0
    }

    #[inline]
    fn as_page_table(&self) -> *mut PageTable {
        ((self.data >> SV39FLAGLEN) << PGSHIFT) as *mut PageTable
    }

    #[inline]
    pub fn as_phys_addr(&self) -> PhysAddr {
        unsafe { PhysAddr::from_raw((self.data >> SV39FLAGLEN) << PGSHIFT) }
    }

    #[inline]
    fn write_zero(&mut self) {
        self.data = 0;
    }

    #[inline]
    fn write(&mut self, pa: PhysAddr) {
        self.data = ((pa.as_usize() >> PGSHIFT) << SV39FLAGLEN) | (PteFlag::V.bits());
    }

    #[inline]
    fn write_perm(&mut self, pa: PhysAddr, perm: PteFlag) {
        self.data = ((pa.as_usize() >> PGSHIFT) << SV39FLAGLEN) | (perm | PteFlag::V).bits()
    }

    #[inline]
    fn read_perm(&self) -> PteFlag {
        PteFlag::from_bits_truncate(self.data)
    }

    /// 复制本表项映射的物理页，返回副本页的指针。
    /// fork 复制用户地址空间时逐页调用。
    ///
    /// # 安全性
    /// 表项必须有效且映射的页可读，返回的页由调用者负责释放。
    unsafe fn try_clone(&self) -> Result<*mut u8, ()> {
        if !self.is_valid() {
            panic!("cloning not valid pte");
        }
        let pa = self.as_phys_addr().into_raw();
        let mem = RawSinglePage::try_new_uninit().map_err(|_| ())?;
        ptr::copy_nonoverlapping(pa as *const u8, mem, PGSIZE);
        Ok(mem)
    }

    /// 释放本表项指向的下一级页表并清零表项。
    /// 只能作用于非叶子表项，叶子的物理页由 uvm_unmap 管。
    fn free(&mut self) {
        if self.is_valid() {
            if !self.is_leaf() {
                drop(unsafe { Box::from_raw(self.as_page_table()) });
                self.data = 0;
            } else {
                panic!("freeing a pte leaf")
            }
        }
    }
}

/// 一页大小的页表，512 个表项，Sv39 三级结构中的一级
#[repr(C, align(4096))]
pub struct PageTable {
    data: [PageTableEntry; 512],
}

impl PageTable {
    pub const fn empty() -> Self {
        Self {
            data: array![_ => PageTableEntry { data: 0 }; 512],
        }
    }

    /// 转成可写入 satp 寄存器的值
    pub fn as_satp(&self) -> usize {
        SATP_SV39 | ((self as *const PageTable as usize) >> PGSHIFT)
    }

    /// 建立 `[va, va+size)` 到 `[pa, ...)` 的映射，权限为 `perm`。
    ///
    /// # 功能说明
    /// 虚拟区间自动对齐到页，逐页调用 `walk_alloc` 取叶子表项写入。
    /// 中间级页表不存在时动态分配。
    ///
    /// # 可能的错误
    /// - 区间内已有有效映射时 panic（remap 属于内核 bug）；
    /// - 新页表页分配失败返回 `Err`。
    pub fn map_pages(
        &mut self,
        mut va: VirtAddr,
        size: usize,
        mut pa: PhysAddr,
        perm: PteFlag,
    ) -> Result<(), &'static str> {
        let mut last = VirtAddr::try_from(va.as_usize() + size)?;
        va.pg_round_down();
        last.pg_round_up();

        while va != last {
            match self.walk_alloc(va) {
                Some(pte) => {
                    if pte.is_valid() {
                        println!(
                            "va: {:#x}, pa: {:#x}, pte: {:#x}",
                            va.as_usize(),
                            pa.as_usize(),
                            pte.data
                        );
                        panic!("remap");
                    }
                    pte.write_perm(pa, perm);
                    va.add_page();
                    pa.add_page();
                }
                None => {
                    return Err("PageTable.map_pages: \
                    not enough memory for new page table")
                }
            }
        }

        Ok(())
    }

    /// 下行遍历页表，返回 va 对应的叶子表项；
    /// 途中缺页表页就现分配一个。分配失败返回 None。
    fn walk_alloc(&mut self, va: VirtAddr) -> Option<&mut PageTableEntry> {
        let mut pgt = self as *mut PageTable;
        for level in (1..=2).rev() {
            let pte = unsafe { &mut pgt.as_mut().unwrap().data[va.page_num(level)] };

            if pte.is_valid() {
                pgt = pte.as_page_table();
            } else {
                let zerod_pgt = unsafe { Box::<Self>::try_new_zeroed().ok()?.assume_init() };
                pgt = Box::into_raw(zerod_pgt);
                pte.write(PhysAddr::try_from(pgt as usize).unwrap());
            }
        }
        unsafe { Some(&mut pgt.as_mut().unwrap().data[va.page_num(0)]) }
    }

    /// 与 [`Self::walk_alloc`] 相同，但缺页表页时不分配，直接返回 None
    fn walk_mut(&mut self, va: VirtAddr) -> Option<&mut PageTableEntry> {
        let mut pgt = self as *mut PageTable;
        for level in (1..=2).rev() {
            let pte = unsafe { &mut pgt.as_mut().unwrap().data[va.page_num(level)] };

            if pte.is_valid() {
                pgt = pte.as_page_table();
            } else {
                return None
            }
        }
        unsafe { Some(&mut pgt.as_mut().unwrap().data[va.page_num(0)]) }
    }

    /// 与 [`Self::walk_mut`] 相同，返回不可变引用
    fn walk(&self, va: VirtAddr) -> Option<&PageTableEntry> {
        let mut pgt = self as *const PageTable;
        for level in (1..=2).rev() {
            let pte = unsafe { &pgt.as_ref().unwrap().data[va.page_num(level)] };

            if pte.is_valid() {
                pgt = pte.as_page_table();
            } else {
                return None
            }
        }
        unsafe { Some(&pgt.as_ref().unwrap().data[va.page_num(0)]) }
    }

    /// 查 va 对应的物理地址（要求映射有效且允许用户态访问），
    /// 返回的物理页可写
    pub fn walk_addr_mut(&mut self, va: VirtAddr)
        -> Result<PhysAddr, &'static str>
    {
        match self.walk_mut(va) {
            Some(pte) => {
                if !pte.is_valid() {
                    Err("pte not valid")
                } else if !pte.is_user() {
                    Err("pte not mapped for user")
                } else {
                    Ok(pte.as_phys_addr())
                }
            }
            None => {
                Err("va not mapped")
            }
        }
    }

    /// 查 va 对应的物理地址（要求映射有效且允许用户态访问）
    pub fn walk_addr(&self, va: VirtAddr)
        -> Result<PhysAddr, &'static str>
    {
        match self.walk(va) {
            Some(pte) => {
                if !pte.is_valid() {
                    Err("pte not valid")
                } else if !pte.is_user() {
                    Err("pte not mapped for user")
                } else {
                    Ok(pte.as_phys_addr())
                }
            }
            None => {
                Err("va not mapped")
            }
        }
    }

    /// 为新进程分配页表，并映射好跳板页与陷阱帧页。
    ///
    /// # 参数
    /// - `trapframe`: 该进程陷阱帧页的物理地址。
    ///
    /// # 返回值
    /// 页表页或映射所需内存分配失败时返回 None。
    pub fn alloc_proc_pagetable(trapframe: usize) -> Option<Box<Self>> {
        extern "C" {
            fn trampoline();
        }

        let mut pagetable = unsafe { Box::<Self>::try_new_zeroed().ok()?.assume_init() };
        pagetable
            .map_pages(
                VirtAddr::from(TRAMPOLINE),
                PGSIZE,
                PhysAddr::try_from(trampoline as usize).unwrap(),
                PteFlag::R | PteFlag::X,
            )
            .ok()?;
        pagetable
            .map_pages(
                VirtAddr::from(TRAPFRAME),
                PGSIZE,
                PhysAddr::try_from(trapframe).unwrap(),
                PteFlag::R | PteFlag::W,
            )
            .ok()?;

        Some(pagetable)
    }

    /// 撤销进程页表的全部用户映射：
    /// 跳板页与陷阱帧页只解除映射（物理页另有归属），
    /// 用户内存逐页解除映射并释放物理页。
    pub fn dealloc_proc_pagetable(&mut self, proc_size: usize) {
        self.uvm_unmap(TRAMPOLINE.into(), 1, false);
        self.uvm_unmap(TRAPFRAME.into(), 1, false);
        if proc_size > 0 {
            self.uvm_unmap(0, pg_round_up(proc_size) / PGSIZE, true);
        }
    }

    /// 装入第一个进程的初始代码页。
    /// 代码拷进新分配的零页，映射到用户空间起始地址。
    ///
    /// # Panics
    /// 代码超过一页时 panic。
    pub fn uvm_init(&mut self, code: &[u8]) {
        if code.len() >= PGSIZE {
            panic!("initcode more than a page");
        }

        let mem = unsafe { RawSinglePage::new_zeroed() as *mut u8 };
        self.map_pages(
            VirtAddr::from(USERTEXT),
            PGSIZE,
            PhysAddr::try_from(mem as usize).unwrap(),
            PteFlag::R | PteFlag::W | PteFlag::X | PteFlag::U)
            .expect("map_page error");
        unsafe { ptr::copy_nonoverlapping(code.as_ptr(), mem, code.len()); }
    }

    /// 用户空间从 old_size 增长到 new_size，逐页分配并映射。
    ///
    /// # 返回值
    /// - `Ok(new_size)`：全部页就位；
    /// - `Err(())`：中途分配或映射失败，已回滚本次新增的页。
    pub fn uvm_alloc(&mut self, old_size: usize, new_size: usize) -> Result<usize, ()> {
        if new_size <= old_size {
            return Ok(old_size)
        }

        let old_size = pg_round_up(old_size);
        for cur_size in (old_size..new_size).step_by(PGSIZE) {
            match unsafe { RawSinglePage::try_new_zeroed() } {
                Err(_) => {
                    self.uvm_dealloc(cur_size, old_size);
                    return Err(())
                },
                Ok(mem) => {
                    match self.map_pages(
                        unsafe { VirtAddr::from_raw(cur_size) },
                        PGSIZE,
                        unsafe { PhysAddr::from_raw(mem as usize) },
                        PteFlag::R | PteFlag::W | PteFlag::X | PteFlag::U
                    ) {
                        Err(s) => {
                            #[cfg(feature = "kernel_warning")]
                            println!("kernel warning: uvm_alloc occurs {}", s);
                            unsafe { RawSinglePage::from_raw_and_drop(mem); }
                            self.uvm_dealloc(cur_size, old_size);
                            return Err(())
                        },
                        Ok(_) => {
                            // mem 的所有权移交页表，回收走 uvm_unmap
                        },
                    }
                },
            }
        }

        Ok(new_size)
    }

    /// 用户空间从 old_size 缩到 new_size，多出的页解除映射并释放
    pub fn uvm_dealloc(&mut self, old_size: usize, new_size: usize) -> usize {
        if new_size >= old_size {
            return old_size
        }

        let old_size_aligned = pg_round_up(old_size);
        let new_size_aligned = pg_round_up(new_size);
        if new_size_aligned < old_size_aligned {
            let count = (old_size_aligned - new_size_aligned) / PGSIZE;
            self.uvm_unmap(new_size_aligned, count, true);
        }

        new_size
    }

    /// 自 va 起解除 count 页映射，`freeing` 为 true 时同时释放物理页。
    ///
    /// # Panics
    /// va 未对齐、映射缺失或表项非叶子时 panic。
    pub fn uvm_unmap(&mut self, va: usize, count: usize, freeing: bool) {
        if va % PGSIZE != 0 {
            panic!("va not page aligned");
        }

        for ca in (va..(va + PGSIZE * count)).step_by(PGSIZE) {
            let pte = self.walk_mut(unsafe { VirtAddr::from_raw(ca) })
                                        .expect("unable to find va available");
            if !pte.is_valid() {
                panic!("this pte is not valid");
            }
            if !pte.is_leaf() {
                panic!("this pte is not a leaf");
            }
            if freeing {
                let pa = pte.as_phys_addr();
                unsafe { RawSinglePage::from_raw_and_drop(pa.into_raw() as *mut u8); }
            }
            pte.write_zero();
        }
    }

    /// 把本页表的前 size 字节用户内存深拷贝进子进程页表。
    /// fork 用。失败时回滚子页表中已建立的映射并返回 `Err`。
    pub fn uvm_copy(&mut self, child_pgt: &mut Self, size: usize) -> Result<(), ()> {
        for i in (0..size).step_by(PGSIZE) {
            let va = unsafe { VirtAddr::from_raw(i) };
            let pte = self.walk(va).expect("pte not exist");
            let mem = unsafe { pte.try_clone() };
            if let Ok(mem) = mem {
                let perm = pte.read_perm();
                if child_pgt.map_pages(va, PGSIZE,
                    unsafe { PhysAddr::from_raw(mem as usize) }, perm).is_ok()
                {
                    continue
                }
                unsafe { RawSinglePage::from_raw_and_drop(mem); }
            }
            child_pgt.uvm_unmap(0, i / PGSIZE, true);
            return Err(())
        }
        Ok(())
    }

    /// 把内核缓冲区 src 的 count 字节写到用户虚拟地址 dst，自动跨页
    pub fn copy_out(&mut self, mut src: *const u8, mut dst: usize, mut count: usize)
        -> Result<(), ()>
    {
        if count == 0 {
            return Ok(())
        }

        let mut va = VirtAddr::try_from(dst).map_err(|_| ())?;
        va.pg_round_down();
        loop {
            let mut pa;
            match self.walk_addr_mut(va) {
                Ok(phys_addr) => pa = phys_addr,
                Err(s) => {
                    #[cfg(feature = "kernel_warning")]
                    println!("kernel warning: {} when pagetable copy_out", s);
                    return Err(())
                }
            }
            let off = dst - va.as_usize();
            let off_from_end = PGSIZE - off;
            let off = off as isize;
            let dst_ptr = unsafe { pa.as_mut_ptr().offset(off) };
            if off_from_end > count {
                unsafe { ptr::copy(src, dst_ptr, count); }
                return Ok(())
            }
            unsafe { ptr::copy(src, dst_ptr, off_from_end); }
            count -= off_from_end;
            src = unsafe { src.offset(off_from_end as isize) };
            dst += off_from_end;
            va.add_page();
            debug_assert_eq!(dst, va.as_usize());
        }
    }

    /// 从用户虚拟地址 src 读 count 字节到内核缓冲区 dst，自动跨页
    pub fn copy_in(&self, mut src: usize, mut dst: *mut u8, mut count: usize)
        -> Result<(), ()>
    {
        let mut va = VirtAddr::try_from(src).map_err(|_| ())?;
        va.pg_round_down();

        if count == 0 {
            match self.walk_addr(va) {
                Ok(_) => return Ok(()),
                Err(s) => {
                    #[cfg(feature = "kernel_warning")]
                    println!("kernel warning: {} when pagetable copy_in", s);
                    return Err(())
                }
            }
        }

        loop {
            let pa;
            match self.walk_addr(va) {
                Ok(phys_addr) => pa = phys_addr,
                Err(s) => {
                    #[cfg(feature = "kernel_warning")]
                    println!("kernel warning: {} when pagetable copy_in", s);
                    return Err(())
                }
            }
            let off = src - va.as_usize();
            let off_from_end = PGSIZE - off;
            let off = off as isize;
            let src_ptr = unsafe { pa.as_ptr().offset(off) };
            if off_from_end > count {
                unsafe { ptr::copy(src_ptr, dst, count); }
                return Ok(())
            }
            unsafe { ptr::copy(src_ptr, dst, off_from_end); }
            count -= off_from_end;
            src += off_from_end;
            dst = unsafe { dst.offset(off_from_end as isize) };
            va.add_page();
            debug_assert_eq!(src, va.as_usize());
        }
    }
}

impl Drop for PageTable {
    /// 递归释放各级子页表页。
    /// 叶子映射的物理页应当在此之前经 uvm_unmap 收回。
    fn drop(&mut self) {
        self.data.iter_mut().for_each(|pte| pte.free());
    }
}
