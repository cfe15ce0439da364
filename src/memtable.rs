//! In-memory write buffer.
//!
//! A memtable is a skiplist whose entries are encoded into its arena as
//!
//! ```text
//! +--------------+--------------+-----------+-------+
//! | klen varint32| internal key | vlen      | value |
//! +--------------+--------------+-----------+-------+
//! ```
//!
//! Entries are never removed or mutated after insertion; the whole table
//! is dropped at once after its contents are flushed to a level-0 table.
//! Sharing is by `Arc`: reads and iterators pin the memtable by holding a
//! clone.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::iterator::Iter;
use crate::keys::{
    extract_user_key, InternalKeyComparator, LookupKey, SequenceNumber, ValueType,
};
use crate::skiplist::{KeyComparator, NodeRef, SkipList};
use crate::util::arena::Arena;
use crate::util::coding::{
    get_length_prefixed_slice, put_length_prefixed_slice, put_varint32, varint_length,
};
use crate::util::coding::decode_fixed64;
use crate::util::comparator::Comparator;

/// Orders encoded memtable entries by their internal-key prefix.
#[derive(Clone)]
pub struct MemKeyComparator {
    icmp: InternalKeyComparator,
}

impl KeyComparator for MemKeyComparator {
    fn compare_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        let mut a = a;
        let mut b = b;
        let akey = get_length_prefixed_slice(&mut a).expect("corrupt memtable entry");
        let bkey = get_length_prefixed_slice(&mut b).expect("corrupt memtable entry");
        self.icmp.compare(akey, bkey)
    }
}

pub struct MemTable {
    icmp: InternalKeyComparator,
    arena: Arc<Arena>,
    list: SkipList<MemKeyComparator>,
}

impl MemTable {
    pub fn new(icmp: InternalKeyComparator) -> Self {
        let arena = Arc::new(Arena::new());
        let list = SkipList::new(
            MemKeyComparator { icmp: icmp.clone() },
            Arc::clone(&arena),
        );
        MemTable { icmp, arena, list }
    }

    /// Approximate bytes in use, safe to sample from any thread.
    pub fn approximate_memory_usage(&self) -> usize {
        self.arena.memory_usage()
    }

    /// Adds an entry. Callers must serialize adds (the write-queue leader
    /// is the only writer).
    pub fn add(&self, seq: SequenceNumber, vtype: ValueType, key: &[u8], value: &[u8]) {
        let internal_key_size = key.len() + 8;
        let encoded_len = varint_length(internal_key_size as u64)
            + internal_key_size
            + varint_length(value.len() as u64)
            + value.len();

        let mut buf = Vec::with_capacity(encoded_len);
        put_varint32(&mut buf, internal_key_size as u32);
        buf.extend_from_slice(key);
        crate::util::coding::put_fixed64(
            &mut buf,
            crate::keys::pack_sequence_and_type(seq, vtype),
        );
        put_length_prefixed_slice(&mut buf, value);
        debug_assert_eq!(buf.len(), encoded_len);

        // One arena allocation per entry; the skiplist stores a pointer
        // into it.
        let dst = self.arena.allocate(encoded_len);
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), dst, encoded_len);
            self.list
                .insert(std::slice::from_raw_parts(dst, encoded_len));
        }
    }

    /// Probes for the newest entry visible to `key`'s sequence.
    ///
    /// Returns `None` when the user key is absent here (the caller
    /// continues to older tables), `Some(None)` when the newest visible
    /// entry is a tombstone, and `Some(Some(value))` otherwise.
    pub fn get(&self, key: &LookupKey) -> Option<Option<Vec<u8>>> {
        let node = self.list.seek(key.memtable_key());
        if node.is_null() {
            return None;
        }
        let mut entry = self.list.key(node);
        let ikey = get_length_prefixed_slice(&mut entry).expect("corrupt memtable entry");
        let user_cmp = self.icmp.user_comparator();
        if user_cmp.compare(extract_user_key(ikey), key.user_key()) != Ordering::Equal {
            return None;
        }
        let tag = decode_fixed64(&ikey[ikey.len() - 8..]);
        match ValueType::from_byte((tag & 0xff) as u8) {
            Some(ValueType::Value) => {
                let value =
                    get_length_prefixed_slice(&mut entry).expect("corrupt memtable entry");
                Some(Some(value.to_vec()))
            }
            Some(ValueType::Deletion) => Some(None),
            None => None,
        }
    }

    pub fn iter(self: &Arc<Self>) -> MemTableIter {
        MemTableIter {
            mem: Arc::clone(self),
            node: NodeRef::NULL,
            scratch: Vec::new(),
        }
    }
}

/// Iterator over a memtable. Keys are internal keys; values are the raw
/// user values. Holds an `Arc` so the memtable (and arena) outlive it.
pub struct MemTableIter {
    mem: Arc<MemTable>,
    node: NodeRef,
    scratch: Vec<u8>,
}

// NodeRef is a pointer into the pinned arena; the skiplist itself is
// Sync, so moving the iterator across threads is fine.
unsafe impl Send for MemTableIter {}

impl MemTableIter {
    fn entry(&self) -> &[u8] {
        self.mem.list.key(self.node)
    }
}

impl Iter for MemTableIter {
    fn valid(&self) -> bool {
        !self.node.is_null()
    }

    fn seek_to_first(&mut self) {
        self.node = self.mem.list.first();
    }

    fn seek_to_last(&mut self) {
        self.node = self.mem.list.last();
    }

    fn seek(&mut self, target: &[u8]) {
        // Targets arrive as bare internal keys; wrap in the length prefix
        // the stored entries carry.
        self.scratch.clear();
        put_varint32(&mut self.scratch, target.len() as u32);
        self.scratch.extend_from_slice(target);
        self.node = self.mem.list.seek(&self.scratch);
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = self.mem.list.next(self.node);
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        let entry = self.entry().to_vec();
        self.node = self.mem.list.find_less_than(&entry);
    }

    fn key(&self) -> &[u8] {
        let mut entry = self.entry();
        get_length_prefixed_slice(&mut entry).expect("corrupt memtable entry")
    }

    fn value(&self) -> &[u8] {
        let mut entry = self.entry();
        let _ikey = get_length_prefixed_slice(&mut entry).expect("corrupt memtable entry");
        get_length_prefixed_slice(&mut entry).expect("corrupt memtable entry")
    }

    fn status(&self) -> crate::error::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::parse_internal_key;
    use crate::util::comparator::BytewiseComparator;

    fn memtable() -> Arc<MemTable> {
        Arc::new(MemTable::new(InternalKeyComparator::new(Arc::new(
            BytewiseComparator,
        ))))
    }

    #[test]
    fn test_add_then_get() {
        let mem = memtable();
        mem.add(1, ValueType::Value, b"foo", b"v1");
        mem.add(2, ValueType::Value, b"bar", b"v2");

        assert_eq!(
            mem.get(&LookupKey::new(b"foo", 10)),
            Some(Some(b"v1".to_vec()))
        );
        assert_eq!(
            mem.get(&LookupKey::new(b"bar", 10)),
            Some(Some(b"v2".to_vec()))
        );
        assert_eq!(mem.get(&LookupKey::new(b"baz", 10)), None);
    }

    #[test]
    fn test_get_respects_sequence() {
        let mem = memtable();
        mem.add(5, ValueType::Value, b"k", b"old");
        mem.add(9, ValueType::Value, b"k", b"new");

        assert_eq!(mem.get(&LookupKey::new(b"k", 4)), None);
        assert_eq!(mem.get(&LookupKey::new(b"k", 5)), Some(Some(b"old".to_vec())));
        assert_eq!(mem.get(&LookupKey::new(b"k", 8)), Some(Some(b"old".to_vec())));
        assert_eq!(mem.get(&LookupKey::new(b"k", 9)), Some(Some(b"new".to_vec())));
    }

    #[test]
    fn test_tombstone_shadows_value() {
        let mem = memtable();
        mem.add(1, ValueType::Value, b"k", b"v");
        mem.add(2, ValueType::Deletion, b"k", b"");

        assert_eq!(mem.get(&LookupKey::new(b"k", 10)), Some(None));
        // The older value is still visible below the tombstone.
        assert_eq!(mem.get(&LookupKey::new(b"k", 1)), Some(Some(b"v".to_vec())));
    }

    #[test]
    fn test_empty_keys_and_values() {
        let mem = memtable();
        mem.add(1, ValueType::Value, b"", b"empty-key");
        mem.add(2, ValueType::Value, b"empty-value", b"");

        assert_eq!(
            mem.get(&LookupKey::new(b"", 10)),
            Some(Some(b"empty-key".to_vec()))
        );
        assert_eq!(
            mem.get(&LookupKey::new(b"empty-value", 10)),
            Some(Some(b"".to_vec()))
        );
    }

    #[test]
    fn test_iterates_in_internal_key_order() {
        let mem = memtable();
        mem.add(3, ValueType::Value, b"a", b"a3");
        mem.add(1, ValueType::Value, b"b", b"b1");
        mem.add(2, ValueType::Value, b"a", b"a2");

        let mut it = mem.iter();
        it.seek_to_first();

        // Same user key: newer sequence first.
        let mut seen = Vec::new();
        while it.valid() {
            let parsed = parse_internal_key(it.key()).expect("bad internal key");
            seen.push((parsed.user_key.to_vec(), parsed.sequence, it.value().to_vec()));
            it.next();
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 3, b"a3".to_vec()),
                (b"a".to_vec(), 2, b"a2".to_vec()),
                (b"b".to_vec(), 1, b"b1".to_vec()),
            ]
        );
    }

    #[test]
    fn test_iterator_seek_and_prev() {
        let mem = memtable();
        for (seq, key) in [(1u64, b"a"), (2, b"b"), (3, b"c")] {
            mem.add(seq, ValueType::Value, key, b"v");
        }

        let mut it = mem.iter();
        let target = LookupKey::new(b"b", 100);
        it.seek(target.internal_key());
        assert!(it.valid());
        assert_eq!(extract_user_key(it.key()), b"b");

        it.prev();
        assert!(it.valid());
        assert_eq!(extract_user_key(it.key()), b"a");

        it.prev();
        assert!(!it.valid());

        it.seek_to_last();
        assert_eq!(extract_user_key(it.key()), b"c");
    }

    #[test]
    fn test_memory_usage_grows() {
        let mem = memtable();
        let before = mem.approximate_memory_usage();
        for i in 0..100u32 {
            mem.add(i as u64 + 1, ValueType::Value, &i.to_le_bytes(), &[0u8; 100]);
        }
        assert!(mem.approximate_memory_usage() > before);
    }
}
