//! Utility functions.

/// Aligns an address or size up to the next multiple of `align`.
/// `align` must be a power of two. Returns `None` on overflow.
pub fn align_up(addr: u64, align: u64) -> Option<u64> {
    assert!(align.is_power_of_two());
    Some(addr.checked_add(align - 1)? & !(align - 1))
}

/// Aligns an address down to the previous multiple of `align`.
/// `align` must be a power of two.
pub fn align_down(addr: u64, align: u64) -> u64 {
    assert!(align.is_power_of_two());
    addr & !(align - 1)
}

/// Parses a number that may carry a `0x` prefix.
pub fn parse_u64(s: &str) -> Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}
