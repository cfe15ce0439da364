//! Filter block construction and probing.
//!
//! One filter is generated per 2 KiB region of table-file offset space.
//! The block is the concatenation of the per-region filters, followed by
//! an offset array, the start of that array, and `lg(region size)`:
//!
//! ```text
//! +----------+----------+-----+---------------+--------------+--------+
//! | filter 0 | filter 1 | ... | offsets (u32) | array offset | lg u8  |
//! +----------+----------+-----+---------------+--------------+--------+
//! ```
//!
//! Regions with no keys get empty filters so the offset array stays
//! dense and a reader can index it directly by `offset >> lg`.

use std::sync::Arc;

use crate::util::bloom::FilterPolicy;
use crate::util::coding::{decode_fixed32, put_fixed32};

/// Generate a new filter every 2 KiB of file offset.
const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    /// Flattened key bytes for the current region.
    keys: Vec<u8>,
    starts: Vec<usize>,
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        FilterBlockBuilder {
            policy,
            keys: Vec::new(),
            starts: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Called with the file offset at which a new data block begins.
    /// Offsets must be non-decreasing across calls.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);
        while (self.filter_offsets.len() as u64) < filter_index {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.starts.push(self.keys.len());
        self.keys.extend_from_slice(key);
    }

    pub fn finish(&mut self) -> &[u8] {
        if !self.starts.is_empty() {
            self.generate_filter();
        }
        let array_offset = self.result.len() as u32;
        let offsets = std::mem::take(&mut self.filter_offsets);
        for offset in offsets {
            put_fixed32(&mut self.result, offset);
        }
        put_fixed32(&mut self.result, array_offset);
        self.result.push(FILTER_BASE_LG);
        &self.result
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.starts.is_empty() {
            // An empty region contributes an empty filter; the offset
            // array still gets an entry for it.
            return;
        }

        self.starts.push(self.keys.len()); // sentinel
        let keys: Vec<&[u8]> = self
            .starts
            .windows(2)
            .map(|w| &self.keys[w[0]..w[1]])
            .collect();
        let filter = self.policy.create_filter(&keys);
        self.result.extend_from_slice(&filter);

        self.keys.clear();
        self.starts.clear();
    }
}

pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Vec<u8>,
    /// Start of the offset array within `data`.
    offset_start: usize,
    num_filters: usize,
    base_lg: u8,
}

impl FilterBlockReader {
    /// Returns None when the block is structurally unusable; the caller
    /// then reads without a filter.
    pub fn new(policy: Arc<dyn FilterPolicy>, data: Vec<u8>) -> Option<Self> {
        let n = data.len();
        if n < 5 {
            return None;
        }
        let base_lg = data[n - 1];
        let offset_start = decode_fixed32(&data[n - 5..]) as usize;
        if offset_start > n - 5 {
            return None;
        }
        let num_filters = (n - 5 - offset_start) / 4;
        Some(FilterBlockReader {
            policy,
            data,
            offset_start,
            num_filters,
            base_lg,
        })
    }

    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num_filters {
            // Out of range: err on the side of reading the block.
            return true;
        }
        let start =
            decode_fixed32(&self.data[self.offset_start + index * 4..]) as usize;
        let limit = if index + 1 < self.num_filters {
            decode_fixed32(&self.data[self.offset_start + (index + 1) * 4..]) as usize
        } else {
            self.offset_start
        };
        if start > limit || limit > self.offset_start {
            // Corrupt offsets: treat as a match.
            return true;
        }
        if start == limit {
            // Empty filter covers no keys.
            return false;
        }
        self.policy.key_may_match(key, &self.data[start..limit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::bloom::BloomFilterPolicy;

    fn policy() -> Arc<dyn FilterPolicy> {
        Arc::new(BloomFilterPolicy::new(10))
    }

    #[test]
    fn test_empty_builder() {
        let mut builder = FilterBlockBuilder::new(policy());
        let block = builder.finish().to_vec();
        // Just the array offset and the lg byte.
        assert_eq!(&block[block.len() - 5..block.len() - 1], &0u32.to_le_bytes());
        let reader = FilterBlockReader::new(policy(), block).expect("bad block");
        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(100_000, b"foo"));
    }

    #[test]
    fn test_single_region() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(100);
        builder.add_key(b"foo");
        builder.add_key(b"bar");
        builder.add_key(b"box");
        builder.start_block(200);
        builder.add_key(b"box");
        builder.start_block(300);
        builder.add_key(b"hello");
        let block = builder.finish().to_vec();

        let reader = FilterBlockReader::new(policy(), block).expect("bad block");
        assert!(reader.key_may_match(100, b"foo"));
        assert!(reader.key_may_match(100, b"bar"));
        assert!(reader.key_may_match(100, b"box"));
        assert!(reader.key_may_match(100, b"hello"));
        assert!(!reader.key_may_match(100, b"missing"));
        assert!(!reader.key_may_match(100, b"other"));
    }

    #[test]
    fn test_multiple_regions_with_gaps() {
        let mut builder = FilterBlockBuilder::new(policy());

        // Region 0 (offsets 0..2047).
        builder.start_block(0);
        builder.add_key(b"foo");
        builder.start_block(2000);
        builder.add_key(b"bar");

        // Region 1 (2048..4095).
        builder.start_block(3100);
        builder.add_key(b"box");

        // Skips regions 2 and 3: they must get empty filters.
        builder.start_block(9000);
        builder.add_key(b"box");
        builder.add_key(b"hello");

        let block = builder.finish().to_vec();
        let reader = FilterBlockReader::new(policy(), block).expect("bad block");

        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(2000, b"bar"));
        assert!(!reader.key_may_match(0, b"box"));

        assert!(reader.key_may_match(3100, b"box"));
        assert!(!reader.key_may_match(3100, b"foo"));

        // The skipped regions match nothing.
        assert!(!reader.key_may_match(4100, b"foo"));
        assert!(!reader.key_may_match(6200, b"box"));

        assert!(reader.key_may_match(9000, b"box"));
        assert!(reader.key_may_match(9000, b"hello"));
        assert!(!reader.key_may_match(9000, b"foo"));
    }

    #[test]
    fn test_reader_rejects_garbage() {
        assert!(FilterBlockReader::new(policy(), vec![]).is_none());
        assert!(FilterBlockReader::new(policy(), vec![1, 2, 3]).is_none());
        // Offset array start beyond the block.
        let mut data = vec![0u8; 3];
        data.extend_from_slice(&100u32.to_le_bytes());
        data.push(11);
        assert!(FilterBlockReader::new(policy(), data).is_none());
    }
}
