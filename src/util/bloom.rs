//! Bloom filter policy for table files.
//!
//! One filter is built per 2 KiB region of a table file (see
//! `sstable::filter_block`); this module only defines the per-filter bit
//! math. The probe count is derived from the configured bits-per-key as
//! `k ≈ bits_per_key · ln 2`, clamped to `[1, 30]`, and probes use double
//! hashing: `h_i = h + i·δ` with `δ = rotl(h, 15)`.

use crate::util::hash::hash;

pub trait FilterPolicy: Send + Sync {
    /// Persisted alongside the filter data; a reader ignores filters whose
    /// policy name does not match its own.
    fn name(&self) -> &str;

    /// Builds filter bytes for `keys`.
    fn create_filter(&self, keys: &[&[u8]]) -> Vec<u8>;

    /// Must return true if `key` was in the set the filter was built from;
    /// may return true for keys that were not (false positive).
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

#[derive(Debug, Clone)]
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    k: usize,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        // Round down to reduce the false-positive rate a little.
        let k = ((bits_per_key as f64) * 0.69) as usize;
        BloomFilterPolicy {
            bits_per_key,
            k: k.clamp(1, 30),
        }
    }
}

fn bloom_hash(key: &[u8]) -> u32 {
    hash(key, 0xbc9f1d34)
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &str {
        "cinderdb.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[&[u8]]) -> Vec<u8> {
        let mut bits = keys.len() * self.bits_per_key;
        // Tiny filters have a high false-positive rate regardless; put a
        // floor under the allocation.
        if bits < 64 {
            bits = 64;
        }
        let bytes = (bits + 7) / 8;
        bits = bytes * 8;

        let mut filter = vec![0u8; bytes + 1];
        filter[bytes] = self.k as u8;
        for key in keys {
            let mut h = bloom_hash(key);
            let delta = h.rotate_left(15);
            for _ in 0..self.k {
                let bit_pos = (h as usize) % bits;
                filter[bit_pos / 8] |= 1 << (bit_pos % 8);
                h = h.wrapping_add(delta);
            }
        }
        filter
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        let len = filter.len();
        if len < 2 {
            return false;
        }
        let bits = (len - 1) * 8;
        let k = filter[len - 1] as usize;
        if k > 30 {
            // Reserved for future encodings; treat as a match rather than
            // misreading the bit array.
            return true;
        }

        let mut h = bloom_hash(key);
        let delta = h.rotate_left(15);
        for _ in 0..k {
            let bit_pos = (h as usize) % bits;
            if filter[bit_pos / 8] & (1 << (bit_pos % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }
}
