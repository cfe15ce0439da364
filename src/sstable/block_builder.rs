//! Prefix-compressed block construction.
//!
//! Keys within a block share prefixes with their predecessor:
//!
//! ```text
//! +---------+------------+-----------+--------------+-------+
//! | shared  | non_shared | value_len | key suffix   | value |
//! | varint32| varint32   | varint32  | non_shared B | bytes |
//! +---------+------------+-----------+--------------+-------+
//! ```
//!
//! Every `block_restart_interval` entries the full key is stored
//! (shared = 0) and its offset recorded; the block ends with the restart
//! offsets and their count, giving readers binary-search entry points.

use crate::util::coding::{put_fixed32, put_varint32};

pub struct BlockBuilder {
    block_restart_interval: usize,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    /// Entries since the last restart point.
    counter: usize,
    finished: bool,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(block_restart_interval: usize) -> Self {
        assert!(block_restart_interval >= 1);
        BlockBuilder {
            block_restart_interval,
            buffer: Vec::new(),
            restarts: vec![0],
            counter: 0,
            finished: false,
            last_key: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.finished = false;
        self.last_key.clear();
    }

    /// Adds an entry. Keys must arrive in strictly increasing order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);
        debug_assert!(self.counter <= self.block_restart_interval);

        let mut shared = 0;
        if self.counter < self.block_restart_interval {
            let min_length = self.last_key.len().min(key.len());
            while shared < min_length && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
        }
        let non_shared = key.len() - shared;

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, non_shared as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Appends the restart array and returns the finished block contents.
    pub fn finish(&mut self) -> &[u8] {
        for &restart in &self.restarts {
            put_fixed32(&mut self.buffer, restart);
        }
        put_fixed32(&mut self.buffer, self.restarts.len() as u32);
        self.finished = true;
        &self.buffer
    }

    /// Uncompressed size of the block were `finish` called now.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_block_still_has_restart_array() {
        let mut builder = BlockBuilder::new(16);
        assert!(builder.is_empty());
        let block = builder.finish();
        // One restart offset (0) plus the count.
        assert_eq!(block.len(), 8);
    }

    #[test]
    fn test_size_estimate_tracks_growth() {
        let mut builder = BlockBuilder::new(16);
        let empty = builder.current_size_estimate();
        builder.add(b"key", b"value");
        assert!(builder.current_size_estimate() > empty);
        let estimate = builder.current_size_estimate();
        assert_eq!(builder.finish().len(), estimate);
    }

    #[test]
    fn test_restart_every_interval() {
        let mut builder = BlockBuilder::new(2);
        builder.add(b"a1", b"v");
        builder.add(b"a2", b"v");
        builder.add(b"a3", b"v"); // starts a new restart
        builder.add(b"a4", b"v");
        let block = builder.finish().to_vec();
        let num_restarts =
            crate::util::coding::decode_fixed32(&block[block.len() - 4..]);
        assert_eq!(num_restarts, 2);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"a", b"1");
        builder.reset();
        assert!(builder.is_empty());
        assert_eq!(builder.last_key(), b"");
    }
}
