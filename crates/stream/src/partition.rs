//! Key-based partitioning.
//!
//! Producers and consumers must agree on which partition owns an order id, across
//! processes and builds, so the hash is a fixed FNV-1a rather than `DefaultHasher`.

use orderflow_core::OrderId;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Partition that owns `key` when a stream is split into `partitions` parts.
///
/// `partitions == 0` is treated as a single partition.
pub fn partition_for(key: &OrderId, partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    let hash = key
        .as_str()
        .bytes()
        .fold(FNV_OFFSET_BASIS, |h, b| (h ^ u32::from(b)).wrapping_mul(FNV_PRIME));
    hash % partitions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_partition_always_zero() {
        let id = OrderId::parse("ORDER-42").unwrap();
        assert_eq!(partition_for(&id, 0), 0);
        assert_eq!(partition_for(&id, 1), 0);
    }

    #[test]
    fn partition_is_stable_and_in_range() {
        let id = OrderId::parse("ORDER-42").unwrap();
        let p = partition_for(&id, 8);
        assert!(p < 8);
        for _ in 0..10 {
            assert_eq!(partition_for(&id, 8), p);
        }
    }

    #[test]
    fn known_fnv1a_value() {
        // FNV-1a("a") = 0xe40c292c
        let id = OrderId::parse("a").unwrap();
        assert_eq!(partition_for(&id, u32::MAX), 0xe40c_292c % u32::MAX);
    }

    #[test]
    fn keys_spread_across_partitions() {
        let mut seen = [false; 4];
        for i in 0..200 {
            let id = OrderId::parse(format!("ORDER-{i}")).unwrap();
            seen[partition_for(&id, 4) as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }
}
