//! 伙伴系统的空闲块链表
//!
//! 每个大小等级一条链表，记录该等级当前空闲的块。链接字段不另外
//! 分配，直接征用空闲块自己的头 16 字节——块只有在空闲时才在链表
//! 里，节点的存活期与块的空闲期天然一致。链表里存的只是"能放块的
//! 地方"，任何一个块最多出现在一条链表里。
//!
//! 表头是 `LevelInfo` 里内嵌的哨兵节点，位于分配器元数据区，
//! 地址在整个运行期间不变，所以哨兵的自引用指针是安全的。

use core::ptr;

use crate::consts::LEAF_SIZE;

// 空闲块要装得下链接字段，这是叶子块 16 字节的由来
const _: () = assert!(core::mem::size_of::<FreeNode>() <= LEAF_SIZE);

/// 写在空闲块开头的链接字段
#[repr(C)]
struct FreeNode {
    prev: *mut FreeNode,
    next: *mut FreeNode,
}

/// 一个大小等级的空闲块链表：环状，带内嵌哨兵。
/// 哨兵自环表示本等级没有空闲块。
#[repr(C)]
pub struct FreeList {
    head: FreeNode,
}

impl FreeList {
    /// 初始化为空链表（哨兵自环）。
    /// 分配器把元数据区整体清零后对每级调用一次。
    pub fn init(&mut self) {
        let head = &mut self.head as *mut FreeNode;
        self.head.prev = head;
        self.head.next = head;
    }

    /// 本等级是否没有空闲块
    pub fn is_empty(&self) -> bool {
        ptr::eq(self.head.next, &self.head)
    }

    /// 把 block 地址处的块挂到表头。
    /// 刚释放或刚劈出来的块都从这里入链。
    ///
    /// # 安全性
    /// - `block` 必须指向一块本等级大小、当前空闲的被管理内存；
    /// - 该块不得已在任何链表里，入链后它的头 16 字节归链表使用。
    pub unsafe fn push(&mut self, block: usize) {
        let node = block as *mut FreeNode;
        ptr::write(node, FreeNode {
            prev: &mut self.head,
            next: self.head.next,
        });
        (*self.head.next).prev = node;
        self.head.next = node;
    }

    /// 取走表头的块，返回块地址。分配路径从这里出链。
    ///
    /// # Panics
    /// 本等级没有空闲块时 panic，调用前应先看 `is_empty`。
    ///
    /// # 安全性
    /// 返回的地址重新归调用者所有。
    pub unsafe fn pop(&mut self) -> usize {
        if self.is_empty() {
            panic!("pop from empty free list");
        }
        let node = self.head.next;
        Self::unlink(node);
        node as usize
    }

    /// 把 block 地址处的块从它所在的链表里摘出来。
    /// 合并时伙伴块可能在本等级链表的任意位置，按地址直接摘，
    /// 不需要知道它挂在哪条链表上。
    ///
    /// # 安全性
    /// `block` 必须是一个当前在某条空闲链表里的块的地址。
    pub unsafe fn unlink_block(block: usize) {
        Self::unlink(block as *mut FreeNode);
    }

    unsafe fn unlink(node: *mut FreeNode) {
        (*(*node).prev).next = (*node).next;
        (*(*node).next).prev = (*node).prev;
    }
}

#[cfg(feature = "unit_test")]
pub mod tests {
    use super::*;

    /// 在一块静态内存上走一圈入链/出链/中间摘除
    pub fn push_pop_unlink() {
        #[repr(C, align(16))]
        struct Arena([u8; 16 * 4]);

        static mut ARENA: Arena = Arena([0; 16 * 4]);

        let mut list = FreeList {
            head: FreeNode {
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
            },
        };
        list.init();
        assert!(list.is_empty());

        let base = unsafe { core::ptr::addr_of_mut!(ARENA.0) as *mut u8 as usize };
        unsafe {
            list.push(base);
            list.push(base + 16);
            list.push(base + 32);
        }
        assert!(!list.is_empty());

        // 摘掉中间的块后，剩下两个按后进先出弹出
        unsafe {
            FreeList::unlink_block(base + 16);
            assert_eq!(list.pop(), base + 32);
            assert_eq!(list.pop(), base);
        }
        assert!(list.is_empty());
    }
}
