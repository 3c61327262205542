//! Key-to-bucket placement.

use std::sync::Arc;

/// Hash function applied to string keys before bucket placement.
///
/// All peers must agree on key placement, so the hash has to be stable
/// across processes and architectures. The default is 64-bit FNV-1a.
pub type KeyHasher = Arc<dyn Fn(&str) -> u64 + Send + Sync>;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x100_0000_01b3;

/// 64-bit FNV-1a over the raw key bytes.
pub fn fnv1a(key: &str) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

pub fn default_key_hasher() -> KeyHasher {
    Arc::new(fnv1a)
}

/// Jump consistent hash (Lamping-Veach).
///
/// Maps `key` to a bucket in `[0, buckets)` in O(log n) time with no
/// per-bucket state. Growing the bucket count from `n` to `n + 1` only ever
/// moves keys into the new bucket, never between existing ones.
///
/// Returns 0 for `buckets == 0`; callers are expected to guard against
/// empty bucket sets.
pub fn jump_hash(mut key: u64, buckets: u32) -> u32 {
    if buckets == 0 {
        return 0;
    }

    const JUMP: u64 = 1 << 31;
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < i64::from(buckets) {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        j = ((b + 1) as f64 * (JUMP as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b as u32
}
