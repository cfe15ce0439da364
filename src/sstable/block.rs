//! Block reader and its bidirectional iterator.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::iterator::Iter;
use crate::util::coding::{decode_fixed32, get_varint32};
use crate::util::comparator::Comparator;

/// An immutable, decoded-in-memory block. Shared between the block cache
/// and any number of iterators.
pub struct Block {
    data: Vec<u8>,
    /// Offset of the restart array.
    restart_offset: usize,
    num_restarts: u32,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::corruption("block too short for restart count"));
        }
        let num_restarts = decode_fixed32(&data[data.len() - 4..]);
        let max_restarts = (data.len() as u64 - 4) / 4;
        if num_restarts as u64 > max_restarts {
            return Err(Error::corruption("block restart count out of bounds"));
        }
        let restart_offset = data.len() - 4 - 4 * num_restarts as usize;
        Ok(Block {
            data,
            restart_offset,
            num_restarts,
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn iter(self: &Arc<Self>, cmp: Arc<dyn Comparator>) -> BlockIter {
        BlockIter {
            block: Arc::clone(self),
            cmp,
            current: self.restart_offset,
            restart_index: self.num_restarts as usize,
            key: Vec::new(),
            value_start: 0,
            value_len: 0,
            status: Ok(()),
        }
    }

    fn restart_point(&self, index: usize) -> usize {
        debug_assert!(index < self.num_restarts as usize);
        decode_fixed32(&self.data[self.restart_offset + 4 * index..]) as usize
    }
}

pub struct BlockIter {
    block: Arc<Block>,
    cmp: Arc<dyn Comparator>,

    /// Offset of the current entry; `restart_offset` means invalid.
    current: usize,
    /// Restart block containing `current`.
    restart_index: usize,

    key: Vec<u8>,
    value_start: usize,
    value_len: usize,
    status: Result<()>,
}

impl BlockIter {
    fn next_entry_offset(&self) -> usize {
        self.value_start + self.value_len
    }

    fn seek_to_restart_point(&mut self, index: usize) {
        self.key.clear();
        self.restart_index = index;
        // parse_next_key picks up from here.
        let offset = self.block.restart_point(index);
        self.value_start = offset;
        self.value_len = 0;
    }

    fn corrupt(&mut self) {
        self.current = self.block.restart_offset;
        self.restart_index = self.block.num_restarts as usize;
        self.status = Err(Error::corruption("bad entry in block"));
        self.key.clear();
        self.value_start = 0;
        self.value_len = 0;
    }

    /// Decodes the entry at `next_entry_offset`, leaving the iterator on
    /// it. Returns false (invalid) at the end of the block.
    fn parse_next_key(&mut self) -> bool {
        self.current = self.next_entry_offset();
        if self.current >= self.block.restart_offset {
            // No more entries.
            self.current = self.block.restart_offset;
            self.restart_index = self.block.num_restarts as usize;
            return false;
        }

        let data = &self.block.data[..self.block.restart_offset];
        let mut p = &data[self.current..];
        let before = p.len();
        let (shared, non_shared, value_len) = match (
            get_varint32(&mut p),
            get_varint32(&mut p),
            get_varint32(&mut p),
        ) {
            (Some(a), Some(b), Some(c)) => (a as usize, b as usize, c as usize),
            _ => {
                self.corrupt();
                return false;
            }
        };
        let header_len = before - p.len();
        if shared > self.key.len() || p.len() < non_shared + value_len {
            self.corrupt();
            return false;
        }

        let suffix_start = self.current + header_len;
        self.key.truncate(shared);
        self.key
            .extend_from_slice(&self.block.data[suffix_start..suffix_start + non_shared]);
        self.value_start = suffix_start + non_shared;
        self.value_len = value_len;

        while self.restart_index + 1 < self.block.num_restarts as usize
            && self.block.restart_point(self.restart_index + 1) < self.current
        {
            self.restart_index += 1;
        }
        true
    }

    fn key_at_restart(&self, index: usize) -> Option<&[u8]> {
        // Restart entries store the full key (shared == 0).
        let offset = self.block.restart_point(index);
        let data = &self.block.data[..self.block.restart_offset];
        let mut p = data.get(offset..)?;
        let before = p.len();
        let shared = get_varint32(&mut p)?;
        let non_shared = get_varint32(&mut p)? as usize;
        let _value_len = get_varint32(&mut p)?;
        if shared != 0 {
            return None;
        }
        let header_len = before - p.len();
        data.get(offset + header_len..offset + header_len + non_shared)
    }
}

impl Iter for BlockIter {
    fn valid(&self) -> bool {
        self.current < self.block.restart_offset
    }

    fn seek_to_first(&mut self) {
        if self.block.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_key();
    }

    fn seek_to_last(&mut self) {
        if self.block.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(self.block.num_restarts as usize - 1);
        while self.parse_next_key() && self.next_entry_offset() < self.block.restart_offset {}
    }

    fn seek(&mut self, target: &[u8]) {
        if self.block.num_restarts == 0 {
            return;
        }

        // Find the last restart point whose key is < target, biased by
        // the current position: monotonically increasing seeks can skip
        // the binary search entirely.
        let mut left = 0usize;
        let mut right = self.block.num_restarts as usize - 1;
        let mut current_key_compare = Ordering::Equal;
        if self.valid() {
            current_key_compare = self.cmp.compare(&self.key, target);
            match current_key_compare {
                Ordering::Less => left = self.restart_index,
                Ordering::Greater => right = self.restart_index,
                Ordering::Equal => return,
            }
        }

        while left < right {
            let mid = (left + right + 1) / 2;
            let ordering = self
                .key_at_restart(mid)
                .map(|mid_key| self.cmp.compare(mid_key, target));
            match ordering {
                Some(Ordering::Less) => left = mid,
                Some(_) => right = mid - 1,
                None => {
                    self.corrupt();
                    return;
                }
            }
        }

        // When the current entry is already in the target's restart block
        // and before it, scan linearly from here instead of re-decoding
        // the block prefix.
        let skip_seek = left == self.restart_index && current_key_compare == Ordering::Less;
        if !skip_seek {
            self.seek_to_restart_point(left);
        }
        loop {
            if !self.parse_next_key() {
                return;
            }
            if self.cmp.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.parse_next_key();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        let original = self.current;
        while self.block.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                // No entries before the first.
                self.current = self.block.restart_offset;
                self.restart_index = self.block.num_restarts as usize;
                return;
            }
            self.restart_index -= 1;
        }
        self.seek_to_restart_point(self.restart_index);
        while self.parse_next_key() && self.next_entry_offset() < original {}
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.block.data[self.value_start..self.value_start + self.value_len]
    }

    fn status(&self) -> Result<()> {
        self.status.clone()
    }
}
