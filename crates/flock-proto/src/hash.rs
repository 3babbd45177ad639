/// FNV-1a hash functions used for ring placement.
///
/// Every node must compute identical token positions for identical
/// membership, so the algorithm is pinned here rather than delegated to
/// `std::hash`.

/// FNV-1a 64-bit initial basis.
const FNV1A_64_INIT: u64 = 0xcbf2_9ce4_8422_2325;
/// FNV-1a 64-bit prime.
const FNV_64_PRIME: u64 = 0x0100_0000_01b3;

/// Compute FNV-1a over a byte buffer, chaining from `hval`.
#[inline]
pub fn fnv_64a_buf(buf: &[u8], mut hval: u64) -> u64 {
    for &byte in buf {
        hval ^= byte as u64;
        hval = hval.wrapping_mul(FNV_64_PRIME);
    }
    hval
}

/// Compute FNV-1a over the eight little-endian bytes of a u64.
#[inline]
pub fn fnv_64a_64(val: u64, mut hval: u64) -> u64 {
    for i in 0..8 {
        hval ^= (val >> (i * 8)) & 0xff;
        hval = hval.wrapping_mul(FNV_64_PRIME);
    }
    hval
}

/// Hash a byte buffer to a ring token (double-hash for distribution).
#[inline]
pub fn hash_buf(buf: &[u8]) -> u64 {
    let hval = fnv_64a_buf(buf, FNV1A_64_INIT);
    fnv_64a_64(hval, hval)
}

/// Hash an object id to its ring start position.
#[inline]
pub fn hash_oid(oid: u64) -> u64 {
    let hval = fnv_64a_64(oid, FNV1A_64_INIT);
    fnv_64a_64(hval, hval)
}

/// Derive the next token in a vnode chain from the previous one.
#[inline]
pub fn hash_next(hval: u64) -> u64 {
    fnv_64a_64(hval, hval)
}
