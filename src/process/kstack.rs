//! 内核栈虚拟地址提供器
//!
//! 进程记录是动态分配的，内核栈虚拟地址也就不能按进程表下标
//! 静态排布。提供器从单调增长的 id 映射出地址（KSTACK 公式），
//! 进程销毁时把地址收回池里复用，否则跳板页下方的地址段会被
//! 一次性 id 慢慢耗光。
//!
//! 地址复用意味着同一个虚拟地址先后指向不同的物理页帧，
//! 调度器切入进程前必须对它做 sfence.vma。

use crate::consts::kstack_va;
use crate::spinlock::SpinLock;

use super::vector::Vector;

/// 全局内核栈地址池
pub static KSTACK_POOL: KstackPool = KstackPool::new();

pub struct KstackPool(SpinLock<KstackInner>);

struct KstackInner {
    /// 收回待复用的虚拟地址
    pool: Vector,
    /// 池空时发放 KSTACK(next_id)，只增不减
    next_id: usize,
}

impl KstackPool {
    const fn new() -> Self {
        Self(SpinLock::new(
            KstackInner {
                pool: Vector::new(),
                next_id: 1,
            },
            "kstack pool lock",
        ))
    }

    /// 发放一个内核栈虚拟地址：池里有就复用，没有就发新的
    pub fn get_va(&self) -> usize {
        let mut inner = self.0.lock();
        if inner.pool.len() > 0 {
            inner.pool.pop_back()
        } else {
            let va = kstack_va(inner.next_id);
            inner.next_id += 1;
            va
        }
    }

    /// 收回一个虚拟地址。
    /// 入池失败（池子扩容拿不到内存）就让这个地址漏掉，无伤大雅。
    pub fn return_va(&self, va: usize) {
        let mut inner = self.0.lock();
        inner.pool.push_back(va).ok();
    }
}

#[cfg(feature = "unit_test")]
pub mod tests {
    use super::KSTACK_POOL;

    /// 收回的地址会被优先复用，且与未收回的地址互不相同
    pub fn reuse() {
        let a = KSTACK_POOL.get_va();
        let b = KSTACK_POOL.get_va();
        assert_ne!(a, b);

        KSTACK_POOL.return_va(a);
        let c = KSTACK_POOL.get_va();
        assert_eq!(c, a);

        KSTACK_POOL.return_va(b);
        KSTACK_POOL.return_va(c);
    }
}
