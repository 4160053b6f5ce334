//! 紧凑位图
//!
//! 伙伴系统的 allocated-xor 位图与 split 位图都落在初始化阶段
//! 手工划出的裸字节区上，这里提供按位访问这些区域的操作。

use bit_field::BitField;

/// 读第 i 位
///
/// # 安全性
/// `bits` 必须覆盖第 i 位所在的字节。
#[inline]
pub unsafe fn get(bits: *const [u8], i: usize) -> bool {
    let byte = bits.get_unchecked(i >> 3).as_ref().unwrap();
    byte.get_bit(i & 0b111)
}

/// 置第 i 位为 1
#[inline]
pub unsafe fn set(bits: *mut [u8], i: usize) {
    let byte = bits.get_unchecked_mut(i >> 3).as_mut().unwrap();
    byte.set_bit(i & 0b111, true);
}

/// 置第 i 位为 0
#[inline]
pub unsafe fn clear(bits: *mut [u8], i: usize) {
    let byte = bits.get_unchecked_mut(i >> 3).as_mut().unwrap();
    byte.set_bit(i & 0b111, false);
}

/// 翻转第 i 位。
/// allocated-xor 位图的更新只用这一个操作：
/// 一侧伙伴的分配状态变化等价于对应位的一次翻转。
#[inline]
pub unsafe fn invert(bits: *mut [u8], i: usize) {
    let byte = bits.get_unchecked_mut(i >> 3).as_mut().unwrap();
    let old = byte.get_bit(i & 0b111);
    byte.set_bit(i & 0b111, !old);
}

#[cfg(feature = "unit_test")]
pub mod tests {
    /// set/clear/invert/get 在字节边界两侧的行为
    pub fn ops() {
        let mut buf = [0u8; 4];
        let bits = &mut buf[..] as *mut [u8];

        unsafe {
            assert!(!super::get(bits, 0));
            super::set(bits, 0);
            super::set(bits, 9);
            assert!(super::get(bits, 0));
            assert!(super::get(bits, 9));
            assert!(!super::get(bits, 8));

            super::invert(bits, 9);
            assert!(!super::get(bits, 9));
            super::invert(bits, 31);
            assert!(super::get(bits, 31));

            super::clear(bits, 0);
            assert!(!super::get(bits, 0));
        }
        assert_eq!(buf[1], 0);
        assert_eq!(buf[3], 0x80);
    }
}
