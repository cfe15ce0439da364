//! Atomic write batches.
//!
//! A batch is a self-describing byte string shared verbatim by the WAL
//! and the memtable apply step:
//!
//! ```text
//! +--------------+-------------+------------------------+
//! | sequence u64 | count u32   | records...             |
//! +--------------+-------------+------------------------+
//! ```
//!
//! Each record is a tag byte (1 = value, 0 = deletion) followed by a
//! length-prefixed key and, for values, a length-prefixed value. The
//! operations in a batch consume consecutive sequence numbers starting
//! at the header's.

use crate::error::{Error, Result};
use crate::keys::{SequenceNumber, ValueType};
use crate::memtable::MemTable;
use crate::util::coding::{
    decode_fixed32, decode_fixed64, get_length_prefixed_slice, put_length_prefixed_slice,
};

/// seq (8) + count (4).
pub const BATCH_HEADER_SIZE: usize = 12;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Visitor for the operations in a batch, in insertion order.
pub trait BatchHandler {
    fn put(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch {
            rep: vec![0; BATCH_HEADER_SIZE],
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Value as u8);
        put_length_prefixed_slice(&mut self.rep, key);
        put_length_prefixed_slice(&mut self.rep, value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Deletion as u8);
        put_length_prefixed_slice(&mut self.rep, key);
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_SIZE, 0);
    }

    /// Bytes this batch occupies in the WAL.
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Replays the operations into `handler` in order.
    pub fn iterate(&self, handler: &mut dyn BatchHandler) -> Result<()> {
        if self.rep.len() < BATCH_HEADER_SIZE {
            return Err(Error::corruption("malformed write batch (too small)"));
        }
        let mut input = &self.rep[BATCH_HEADER_SIZE..];
        let mut found = 0u32;
        while !input.is_empty() {
            let tag = input[0];
            input = &input[1..];
            match ValueType::from_byte(tag) {
                Some(ValueType::Value) => {
                    let key = get_length_prefixed_slice(&mut input)
                        .ok_or_else(|| Error::corruption("bad write batch put"))?;
                    let value = get_length_prefixed_slice(&mut input)
                        .ok_or_else(|| Error::corruption("bad write batch put"))?;
                    handler.put(key, value);
                }
                Some(ValueType::Deletion) => {
                    let key = get_length_prefixed_slice(&mut input)
                        .ok_or_else(|| Error::corruption("bad write batch delete"))?;
                    handler.delete(key);
                }
                None => return Err(Error::corruption("unknown write batch tag")),
            }
            found += 1;
        }
        if found != self.count() {
            return Err(Error::corruption("write batch has wrong count"));
        }
        Ok(())
    }

    pub fn count(&self) -> u32 {
        decode_fixed32(&self.rep[8..12])
    }

    pub(crate) fn set_count(&mut self, count: u32) {
        self.rep[8..12].copy_from_slice(&count.to_le_bytes());
    }

    pub(crate) fn sequence(&self) -> SequenceNumber {
        decode_fixed64(&self.rep[..8])
    }

    pub(crate) fn set_sequence(&mut self, seq: SequenceNumber) {
        self.rep[..8].copy_from_slice(&seq.to_le_bytes());
    }

    /// Applies every operation to `mem`, tagging them with consecutive
    /// sequence numbers from the header.
    pub(crate) fn insert_into(&self, mem: &MemTable) -> Result<()> {
        let mut inserter = MemTableInserter {
            sequence: self.sequence(),
            mem,
        };
        self.iterate(&mut inserter)
    }

    /// Appends `other`'s operations to this batch (sequence untouched).
    pub(crate) fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[BATCH_HEADER_SIZE..]);
    }

    pub(crate) fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Adopts raw bytes read back from the WAL.
    pub(crate) fn set_contents(&mut self, contents: &[u8]) -> Result<()> {
        if contents.len() < BATCH_HEADER_SIZE {
            return Err(Error::corruption("log record too small"));
        }
        self.rep.clear();
        self.rep.extend_from_slice(contents);
        Ok(())
    }
}

struct MemTableInserter<'a> {
    sequence: SequenceNumber,
    mem: &'a MemTable,
}

impl BatchHandler for MemTableInserter<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.mem.add(self.sequence, ValueType::Value, key, value);
        self.sequence += 1;
    }

    fn delete(&mut self, key: &[u8]) {
        self.mem.add(self.sequence, ValueType::Deletion, key, b"");
        self.sequence += 1;
    }
}
