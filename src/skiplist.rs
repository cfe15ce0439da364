//! Concurrent-read / single-writer skiplist.
//!
//! Backs the memtable. Readers need no locks: they only require that the
//! list (and its arena) outlives them. Writes must be externally
//! serialized; the engine guarantees this because only the write-queue
//! leader inserts.
//!
//! Memory ordering is the load-bearing part:
//! - a node's per-level `next` pointer is published with a release store
//!   and read with an acquire load, so a reader that observes the pointer
//!   also observes the node's initialized contents;
//! - `max_height` uses relaxed loads and stores. A reader that observes a
//!   stale (smaller) height just searches from a lower level. One that
//!   observes a new height before the node is linked sees either null or
//!   a validly published pointer at the extra levels; both are safe since
//!   null sorts after every key.
//!
//! Nodes live in the arena and are never freed or mutated after linking
//! (aside from their `next` towers), so iterators never observe a torn
//! node.

use std::cmp::Ordering;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering as MemOrder};
use std::sync::{Arc, Mutex};

use crate::util::arena::Arena;
use crate::util::random::Random;

pub const MAX_HEIGHT: usize = 12;
const BRANCHING: u32 = 4;

/// Ordering over the raw entry encodings stored in the list.
pub trait KeyComparator: Send + Sync {
    fn compare_keys(&self, a: &[u8], b: &[u8]) -> Ordering;
}

#[repr(C)]
struct Node {
    key_ptr: *const u8,
    key_len: usize,
    // Only the first `height` slots are linked; the rest stay null.
    next: [AtomicPtr<Node>; MAX_HEIGHT],
}

impl Node {
    fn key(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.key_ptr, self.key_len) }
    }

    fn next(&self, level: usize) -> *mut Node {
        self.next[level].load(MemOrder::Acquire)
    }

    fn set_next(&self, level: usize, node: *mut Node) {
        self.next[level].store(node, MemOrder::Release);
    }

    fn no_barrier_next(&self, level: usize) -> *mut Node {
        self.next[level].load(MemOrder::Relaxed)
    }

    fn no_barrier_set_next(&self, level: usize, node: *mut Node) {
        self.next[level].store(node, MemOrder::Relaxed);
    }
}

/// An opaque position in the list. Null means "before the first entry" or
/// "past the last", depending on how it was produced.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NodeRef(*const Node);

impl NodeRef {
    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    pub const NULL: NodeRef = NodeRef(ptr::null());
}

pub struct SkipList<C: KeyComparator> {
    cmp: C,
    arena: Arc<Arena>,
    head: *mut Node,
    max_height: AtomicUsize,
    rnd: Mutex<Random>,
}

unsafe impl<C: KeyComparator> Send for SkipList<C> {}
unsafe impl<C: KeyComparator> Sync for SkipList<C> {}

impl<C: KeyComparator> SkipList<C> {
    pub fn new(cmp: C, arena: Arc<Arena>) -> Self {
        let list = SkipList {
            cmp,
            arena,
            head: ptr::null_mut(),
            max_height: AtomicUsize::new(1),
            rnd: Mutex::new(Random::new(0xdeadbeef)),
        };
        let head = list.new_node(&[], MAX_HEIGHT);
        SkipList { head, ..list }
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    fn new_node(&self, key: &[u8], _height: usize) -> *mut Node {
        let mem = self.arena.allocate_aligned(std::mem::size_of::<Node>()) as *mut Node;
        unsafe {
            ptr::write(
                mem,
                Node {
                    key_ptr: key.as_ptr(),
                    key_len: key.len(),
                    next: Default::default(),
                },
            );
        }
        mem
    }

    fn current_max_height(&self) -> usize {
        self.max_height.load(MemOrder::Relaxed)
    }

    fn random_height(&self) -> usize {
        let mut rnd = self.rnd.lock().unwrap();
        let mut height = 1;
        while height < MAX_HEIGHT && rnd.one_in(BRANCHING) {
            height += 1;
        }
        height
    }

    fn key_is_after_node(&self, key: &[u8], node: *mut Node) -> bool {
        !node.is_null() && self.cmp.compare_keys(unsafe { (*node).key() }, key) == Ordering::Less
    }

    fn find_greater_or_equal(
        &self,
        key: &[u8],
        mut prev: Option<&mut [*mut Node; MAX_HEIGHT]>,
    ) -> *mut Node {
        let mut x = self.head;
        let mut level = self.current_max_height() - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if self.key_is_after_node(key, next) {
                x = next;
            } else {
                if let Some(prev) = prev.as_deref_mut() {
                    prev[level] = x;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    fn find_less_than_node(&self, key: &[u8]) -> *mut Node {
        let mut x = self.head;
        let mut level = self.current_max_height() - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if !next.is_null()
                && self.cmp.compare_keys(unsafe { (*next).key() }, key) == Ordering::Less
            {
                x = next;
            } else if level == 0 {
                return x;
            } else {
                level -= 1;
            }
        }
    }

    fn find_last_node(&self) -> *mut Node {
        let mut x = self.head;
        let mut level = self.current_max_height() - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if !next.is_null() {
                x = next;
            } else if level == 0 {
                return x;
            } else {
                level -= 1;
            }
        }
    }

    /// Inserts `key`. The slice must stay valid for the life of the list;
    /// the memtable satisfies this by encoding entries into the shared
    /// arena first. Duplicate keys are forbidden (internal keys are unique
    /// because sequence numbers are). Callers must serialize insertions.
    pub fn insert(&self, key: &[u8]) {
        let mut prev = [ptr::null_mut(); MAX_HEIGHT];
        let x = self.find_greater_or_equal(key, Some(&mut prev));
        debug_assert!(
            x.is_null() || self.cmp.compare_keys(unsafe { (*x).key() }, key) != Ordering::Equal,
            "duplicate key inserted into skiplist"
        );

        let height = self.random_height();
        let max_height = self.current_max_height();
        if height > max_height {
            for p in prev.iter_mut().take(height).skip(max_height) {
                *p = self.head;
            }
            self.max_height.store(height, MemOrder::Relaxed);
        }

        let node = self.new_node(key, height);
        for (level, &pred) in prev.iter().enumerate().take(height) {
            unsafe {
                // The node is not visible yet, so its own pointer can be
                // set without a barrier; the store into the predecessor
                // publishes it.
                (*node).no_barrier_set_next(level, (*pred).no_barrier_next(level));
                (*pred).set_next(level, node);
            }
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let x = self.find_greater_or_equal(key, None);
        !x.is_null() && self.cmp.compare_keys(unsafe { (*x).key() }, key) == Ordering::Equal
    }

    /// First entry with key >= `key`, or null.
    pub fn seek(&self, key: &[u8]) -> NodeRef {
        NodeRef(self.find_greater_or_equal(key, None))
    }

    /// First entry, or null when empty.
    pub fn first(&self) -> NodeRef {
        NodeRef(unsafe { (*self.head).next(0) })
    }

    /// Last entry, or null when empty.
    pub fn last(&self) -> NodeRef {
        let node = self.find_last_node();
        if node == self.head {
            NodeRef::NULL
        } else {
            NodeRef(node)
        }
    }

    /// Last entry with key < `key`, or null.
    pub fn find_less_than(&self, key: &[u8]) -> NodeRef {
        let node = self.find_less_than_node(key);
        if node == self.head {
            NodeRef::NULL
        } else {
            NodeRef(node)
        }
    }

    pub fn next(&self, node: NodeRef) -> NodeRef {
        debug_assert!(!node.is_null());
        NodeRef(unsafe { (*node.0).next(0) })
    }

    pub fn key(&self, node: NodeRef) -> &[u8] {
        debug_assert!(!node.is_null());
        unsafe { (*node.0).key() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicBool;

    struct NumericCmp;

    impl KeyComparator for NumericCmp {
        fn compare_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
            a.cmp(b)
        }
    }

    fn list() -> SkipList<NumericCmp> {
        SkipList::new(NumericCmp, Arc::new(Arena::new()))
    }

    // Copies key bytes into the list's arena so the stored pointer is
    // valid for the list's lifetime, as the memtable does.
    fn insert(list: &SkipList<NumericCmp>, key: &[u8]) {
        let ptr = list.arena().allocate(key.len().max(1));
        unsafe {
            ptr::copy_nonoverlapping(key.as_ptr(), ptr, key.len());
            list.insert(std::slice::from_raw_parts(ptr, key.len()));
        }
    }

    fn encode(n: u64) -> Vec<u8> {
        n.to_be_bytes().to_vec()
    }

    #[test]
    fn test_empty() {
        let list = list();
        assert!(!list.contains(&encode(10)));
        assert!(list.first().is_null());
        assert!(list.last().is_null());
        assert!(list.seek(&encode(100)).is_null());
    }

    #[test]
    fn test_insert_and_lookup() {
        const N: u64 = 2000;
        const R: u64 = 5000;
        let mut rnd = Random::new(1000);
        let mut keys = BTreeSet::new();
        let list = list();

        for _ in 0..N {
            let key = rnd.next() as u64 % R;
            if keys.insert(key) {
                insert(&list, &encode(key));
            }
        }

        for i in 0..R {
            assert_eq!(list.contains(&encode(i)), keys.contains(&i), "key {i}");
        }

        // Forward iteration visits exactly the sorted key set.
        let mut node = list.first();
        for expected in &keys {
            assert!(!node.is_null());
            assert_eq!(list.key(node), encode(*expected).as_slice());
            node = list.next(node);
        }
        assert!(node.is_null());

        // Seek lands on the smallest key >= target.
        for i in 0..R {
            let node = list.seek(&encode(i));
            match keys.range(i..).next() {
                Some(&expected) => {
                    assert!(!node.is_null());
                    assert_eq!(list.key(node), encode(expected).as_slice());
                }
                None => assert!(node.is_null()),
            }
        }

        // find_less_than is the backward analogue.
        for i in 0..R {
            let node = list.find_less_than(&encode(i));
            match keys.range(..i).next_back() {
                Some(&expected) => {
                    assert!(!node.is_null());
                    assert_eq!(list.key(node), encode(expected).as_slice());
                }
                None => assert!(node.is_null()),
            }
        }

        let last = list.last();
        assert_eq!(
            list.key(last),
            encode(*keys.iter().next_back().unwrap()).as_slice()
        );
    }

    #[test]
    fn test_concurrent_readers_see_sorted_prefixes() {
        // One writer inserts ascending keys while readers continuously
        // scan. Readers must always observe a strictly sorted list whose
        // contents are a subset of what has been inserted.
        let list = Arc::new(list());
        let stop = Arc::new(AtomicBool::new(false));

        let mut readers = Vec::new();
        for _ in 0..3 {
            let list = Arc::clone(&list);
            let stop = Arc::clone(&stop);
            readers.push(std::thread::spawn(move || {
                while !stop.load(MemOrder::Acquire) {
                    let mut node = list.first();
                    let mut prev_key: Option<Vec<u8>> = None;
                    let mut count = 0usize;
                    while !node.is_null() {
                        let key = list.key(node).to_vec();
                        if let Some(prev) = &prev_key {
                            assert!(prev < &key, "reader observed out-of-order keys");
                        }
                        prev_key = Some(key);
                        node = list.next(node);
                        count += 1;
                    }
                    assert!(count <= 3000);
                }
            }));
        }

        for i in 0..3000u64 {
            insert(&list, &encode(i));
        }
        stop.store(true, MemOrder::Release);
        for reader in readers {
            reader.join().expect("reader panicked");
        }

        // Everything the writer inserted is visible afterwards.
        for i in 0..3000u64 {
            assert!(list.contains(&encode(i)));
        }
    }
}
