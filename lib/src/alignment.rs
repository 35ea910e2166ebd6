//! Power-of-two alignment helpers.

#[inline]
pub const fn align_up_u64(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two(), "align must be power of two");
    (value + align - 1) & !(align - 1)
}

#[inline]
pub const fn align_down_u64(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two(), "align must be power of two");
    value & !(align - 1)
}

#[inline]
pub const fn align_up_usize(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two(), "align must be power of two");
    (value + align - 1) & !(align - 1)
}

#[inline]
pub const fn align_down_usize(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two(), "align must be power of two");
    value & !(align - 1)
}

#[inline]
pub const fn is_aligned_usize(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}
