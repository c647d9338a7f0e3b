//! Record-to-partition mapping.
//!
//! Keyed records go to `murmur2(key) & 0x7fffffff % partitions`, which matches
//! the Java client's default partitioner, so a key lands on the same partition
//! it would in a real cluster. Unkeyed records rotate round-robin.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Kafka's murmur2 variant (seed `0x9747b28c`).
pub fn murmur2(data: &[u8]) -> i32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let length = data.len();
    let mut h: u32 = SEED ^ (length as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h as i32
}

/// Partition for a keyed record.
pub fn partition_for_key(key: &[u8], partitions: i32) -> i32 {
    if partitions <= 0 {
        return 0;
    }
    (murmur2(key) & 0x7fff_ffff) % partitions
}

/// Chooses partitions for records of one topic.
#[derive(Debug, Default)]
pub struct Partitioner {
    next: AtomicUsize,
}

impl Partitioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(&self, key: Option<&[u8]>, partitions: i32) -> i32 {
        match key {
            Some(key) => partition_for_key(key, partitions),
            None if partitions > 0 => {
                let slot = self.next.fetch_add(1, Ordering::Relaxed);
                // partitions > 0, so the conversion cannot fail
                let count = usize::try_from(partitions).unwrap_or(1);
                i32::try_from(slot % count).unwrap_or(0)
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn murmur2_matches_reference_values() {
        // Values produced by org.apache.kafka.common.utils.Utils.murmur2
        assert_eq!(murmur2(b"21"), -973_932_308);
        assert_eq!(murmur2(b"foobar"), -790_332_482);
        assert_eq!(murmur2(b"a-little-bit-long-string"), -985_981_536);
        assert_eq!(murmur2(b"a-little-bit-longer-string"), -1_486_304_829);
        assert_eq!(
            murmur2(b"lkjh234lh9fiuh90y23oiuhsafujhadof229phr9h19h89h8"),
            -58_897_971
        );
        assert_eq!(murmur2(b"abc"), 479_470_107);
    }

    #[test]
    fn keyed_records_are_stable() {
        let first = partition_for_key(b"order-17", 6);
        for _ in 0..10 {
            assert_eq!(partition_for_key(b"order-17", 6), first);
        }
        assert!((0..6).contains(&first));
    }

    #[test]
    fn unkeyed_records_round_robin() {
        let partitioner = Partitioner::new();
        let picks: Vec<i32> = (0..6).map(|_| partitioner.partition(None, 3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn zero_partitions_maps_to_zero() {
        assert_eq!(partition_for_key(b"x", 0), 0);
        assert_eq!(Partitioner::new().partition(None, 0), 0);
    }
}
