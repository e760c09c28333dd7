// FNV-1a, 32-bit. Zero is reserved for "not yet computed" in cached hashes.

pub(crate) const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
pub(crate) const FNV_PRIME: u32 = 0x0100_0193;

#[inline]
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    nonzero(hash)
}

/// Fold one more 32-bit hash into a running FNV-style accumulator.
#[inline]
pub(crate) fn combine(acc: u32, h: u32) -> u32 {
    (acc ^ h).wrapping_mul(FNV_PRIME)
}

#[inline]
pub(crate) fn nonzero(hash: u32) -> u32 {
    if hash == 0 { 1 } else { hash }
}

/// Avalanche a 64-bit pattern down to 32 bits (used for numbers and handles).
#[inline]
pub(crate) fn mix64(mut x: u64) -> u32 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;
    nonzero(x as u32)
}
