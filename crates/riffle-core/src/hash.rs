//! The flow-wide hash.
//!
//! FNV-1a over 32 bits, pinned here because every producer and consumer in
//! a flow must agree on partition placement. The same function also names
//! flows: the flow hash code is FNV-1a over the serialized step list.

use crate::row::{encode_row, Value};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 16_777_619;

/// FNV-1a, 32-bit.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Maps a key tuple onto one of `partition_count` partitions.
///
/// Hashes the canonical MessagePack encoding of the key fields, so the
/// result depends only on the key values and the partition count.
pub fn partition_of(keys: &[Value], partition_count: usize) -> usize {
    debug_assert!(partition_count > 0);
    fnv1a32(&encode_row(keys)) as usize % partition_count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_published_fnv1a_vectors() {
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn partition_is_deterministic_and_in_range() {
        let keys = vec![Value::from("k1")];
        let p = partition_of(&keys, 4);
        assert!(p < 4);
        assert_eq!(p, partition_of(&keys, 4));
        assert_eq!(partition_of(&keys, 1), 0);
    }

    #[test]
    fn different_keys_spread_across_partitions() {
        let hits: std::collections::HashSet<usize> = (0..64)
            .map(|i| partition_of(&[Value::from(format!("key-{}", i))], 8))
            .collect();
        assert!(hits.len() > 1, "64 keys should not all land in one partition");
    }
}
