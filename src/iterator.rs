//! Internal iteration.
//!
//! Internal iterators are bidirectional cursors over `(key, value)` byte
//! pairs: memtable entries, table blocks, whole tables, and merged views
//! all implement the same `Iter` trait so the read path can compose them.
//! An invalid iterator is "nowhere"; `seek*` repositions it. `key` and
//! `value` may only be called while valid.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::util::comparator::Comparator;

pub trait Iter: Send {
    fn valid(&self) -> bool;
    fn seek_to_first(&mut self);
    fn seek_to_last(&mut self);
    /// Positions at the first entry with key >= `target`.
    fn seek(&mut self, target: &[u8]);
    fn next(&mut self);
    fn prev(&mut self);
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
    /// First error this iterator (or a source it draws from) hit.
    fn status(&self) -> Result<()>;
}

/// An iterator over nothing, optionally carrying an error. Stands in for
/// a data source that could not be opened.
pub struct EmptyIter {
    status: Result<()>,
}

impl EmptyIter {
    pub fn new() -> Self {
        EmptyIter { status: Ok(()) }
    }

    pub fn with_error(err: Error) -> Self {
        EmptyIter { status: Err(err) }
    }
}

impl Default for EmptyIter {
    fn default() -> Self {
        Self::new()
    }
}

impl Iter for EmptyIter {
    fn valid(&self) -> bool {
        false
    }
    fn seek_to_first(&mut self) {}
    fn seek_to_last(&mut self) {}
    fn seek(&mut self, _target: &[u8]) {}
    fn next(&mut self) {}
    fn prev(&mut self) {}
    fn key(&self) -> &[u8] {
        panic!("key() on invalid iterator")
    }
    fn value(&self) -> &[u8] {
        panic!("value() on invalid iterator")
    }
    fn status(&self) -> Result<()> {
        self.status.clone()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// K-way merge of ordered children.
///
/// The children cover overlapping key ranges (memtable, then tables from
/// newer to older); the merge presents their union in comparator order.
/// Entries with equal keys never occur here because internal keys are
/// unique.
pub struct MergingIter {
    cmp: Arc<dyn Comparator>,
    children: Vec<Box<dyn Iter>>,
    current: Option<usize>,
    direction: Direction,
}

impl MergingIter {
    pub fn new(cmp: Arc<dyn Comparator>, children: Vec<Box<dyn Iter>>) -> Self {
        MergingIter {
            cmp,
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if child.valid() {
                match smallest {
                    None => smallest = Some(i),
                    Some(s) => {
                        if self.cmp.compare(child.key(), self.children[s].key())
                            == Ordering::Less
                        {
                            smallest = Some(i);
                        }
                    }
                }
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate().rev() {
            if child.valid() {
                match largest {
                    None => largest = Some(i),
                    Some(l) => {
                        if self.cmp.compare(child.key(), self.children[l].key())
                            == Ordering::Greater
                        {
                            largest = Some(i);
                        }
                    }
                }
            }
        }
        self.current = largest;
    }
}

impl Iter for MergingIter {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.find_largest();
        self.direction = Direction::Reverse;
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn next(&mut self) {
        let cur = self.current.expect("next() on invalid iterator");

        // After reverse movement every non-current child sits before
        // key(); advance them all past it first.
        if self.direction != Direction::Forward {
            let key = self.children[cur].key().to_vec();
            for i in 0..self.children.len() {
                if i == cur {
                    continue;
                }
                let child = &mut self.children[i];
                child.seek(&key);
                if child.valid() && self.cmp.compare(&key, child.key()) == Ordering::Equal {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[cur].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        let cur = self.current.expect("prev() on invalid iterator");

        // After forward movement every non-current child sits at-or-after
        // key(); back them all up before it first.
        if self.direction != Direction::Reverse {
            let key = self.children[cur].key().to_vec();
            for i in 0..self.children.len() {
                if i == cur {
                    continue;
                }
                let child = &mut self.children[i];
                child.seek(&key);
                if child.valid() {
                    // Child is at the first entry >= key(); step back.
                    child.prev();
                } else {
                    // Everything in this child is < key().
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[cur].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        let cur = self.current.expect("key() on invalid iterator");
        self.children[cur].key()
    }

    fn value(&self) -> &[u8] {
        let cur = self.current.expect("value() on invalid iterator");
        self.children[cur].value()
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}

/// The value a block function receives: an index entry's value (a block
/// handle encoding). It returns an iterator over that block, or an empty
/// iterator carrying an error.
pub type BlockIterBuilder = Box<dyn FnMut(&[u8]) -> Box<dyn Iter> + Send>;

/// Outer/inner iterator glue: walks index entries, materializing the data
/// block each one points at, and transparently skips empty blocks.
pub struct TwoLevelIter {
    index_iter: Box<dyn Iter>,
    block_fn: BlockIterBuilder,
    data_iter: Option<Box<dyn Iter>>,
    // Handle that produced `data_iter`; lets monotone movement reuse it.
    data_block_handle: Vec<u8>,
}

impl TwoLevelIter {
    pub fn new(index_iter: Box<dyn Iter>, block_fn: BlockIterBuilder) -> Self {
        TwoLevelIter {
            index_iter,
            block_fn,
            data_iter: None,
            data_block_handle: Vec::new(),
        }
    }

    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.data_iter = None;
            return;
        }
        let handle = self.index_iter.value();
        if self.data_iter.is_some() && handle == self.data_block_handle.as_slice() {
            // Already positioned in this block.
            return;
        }
        self.data_block_handle = handle.to_vec();
        let handle = self.data_block_handle.clone();
        self.data_iter = Some((self.block_fn)(&handle));
    }

    fn skip_empty_data_blocks_forward(&mut self) {
        while self.data_iter.as_ref().map_or(true, |d| !d.valid()) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(d) = &mut self.data_iter {
                d.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        while self.data_iter.as_ref().map_or(true, |d| !d.valid()) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(d) = &mut self.data_iter {
                d.seek_to_last();
            }
        }
    }
}

impl Iter for TwoLevelIter {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().map_or(false, |d| d.valid())
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(d) = &mut self.data_iter {
            d.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(d) = &mut self.data_iter {
            d.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(d) = &mut self.data_iter {
            d.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        if let Some(d) = &mut self.data_iter {
            d.next();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if let Some(d) = &mut self.data_iter {
            d.prev();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().expect("key() on invalid iterator").key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter
            .as_ref()
            .expect("value() on invalid iterator")
            .value()
    }

    fn status(&self) -> Result<()> {
        self.index_iter.status()?;
        if let Some(d) = &self.data_iter {
            d.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// A vector-backed iterator over pre-sorted pairs, for exercising the
    /// combinators without real storage.
    pub struct VecIter {
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        // One past the end means invalid.
        pos: usize,
    }

    impl VecIter {
        pub fn new(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
            let pos = entries.len();
            VecIter { entries, pos }
        }
    }

    impl Iter for VecIter {
        fn valid(&self) -> bool {
            self.pos < self.entries.len()
        }
        fn seek_to_first(&mut self) {
            self.pos = 0;
        }
        fn seek_to_last(&mut self) {
            self.pos = self.entries.len().saturating_sub(1);
            if self.entries.is_empty() {
                self.pos = 0;
            }
        }
        fn seek(&mut self, target: &[u8]) {
            self.pos = self
                .entries
                .partition_point(|(k, _)| k.as_slice() < target);
        }
        fn next(&mut self) {
            debug_assert!(self.valid());
            self.pos += 1;
        }
        fn prev(&mut self) {
            debug_assert!(self.valid());
            if self.pos == 0 {
                self.pos = self.entries.len();
            } else {
                self.pos -= 1;
            }
        }
        fn key(&self) -> &[u8] {
            &self.entries[self.pos].0
        }
        fn value(&self) -> &[u8] {
            &self.entries[self.pos].1
        }
        fn status(&self) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::VecIter;
    use super::*;
    use crate::util::comparator::BytewiseComparator;

    fn pairs(keys: &[&str]) -> Vec<(Vec<u8>, Vec<u8>)> {
        keys.iter()
            .map(|k| (k.as_bytes().to_vec(), format!("v-{k}").into_bytes()))
            .collect()
    }

    fn merger(sources: Vec<Vec<(Vec<u8>, Vec<u8>)>>) -> MergingIter {
        let children: Vec<Box<dyn Iter>> = sources
            .into_iter()
            .map(|s| Box::new(VecIter::new(s)) as Box<dyn Iter>)
            .collect();
        MergingIter::new(Arc::new(BytewiseComparator), children)
    }

    #[test]
    fn test_merge_forward() {
        let mut it = merger(vec![
            pairs(&["a", "d", "g"]),
            pairs(&["b", "e"]),
            pairs(&["c", "f", "h"]),
        ]);
        it.seek_to_first();
        let mut got = Vec::new();
        while it.valid() {
            got.push(String::from_utf8(it.key().to_vec()).unwrap());
            it.next();
        }
        assert_eq!(got, vec!["a", "b", "c", "d", "e", "f", "g", "h"]);
    }

    #[test]
    fn test_merge_backward() {
        let mut it = merger(vec![pairs(&["a", "d"]), pairs(&["b", "c", "e"])]);
        it.seek_to_last();
        let mut got = Vec::new();
        while it.valid() {
            got.push(String::from_utf8(it.key().to_vec()).unwrap());
            it.prev();
        }
        assert_eq!(got, vec!["e", "d", "c", "b", "a"]);
    }

    #[test]
    fn test_merge_seek_and_direction_flips() {
        let mut it = merger(vec![pairs(&["a", "c", "e"]), pairs(&["b", "d", "f"])]);
        it.seek(b"c");
        assert!(it.valid());
        assert_eq!(it.key(), b"c");

        // Forward -> reverse.
        it.prev();
        assert_eq!(it.key(), b"b");
        it.prev();
        assert_eq!(it.key(), b"a");

        // Reverse -> forward.
        it.next();
        assert_eq!(it.key(), b"b");
        it.next();
        assert_eq!(it.key(), b"c");
        it.next();
        assert_eq!(it.key(), b"d");
    }

    #[test]
    fn test_merge_empty_children() {
        let mut it = merger(vec![vec![], pairs(&["x"]), vec![]]);
        it.seek_to_first();
        assert!(it.valid());
        assert_eq!(it.key(), b"x");
        it.next();
        assert!(!it.valid());

        let mut empty = merger(vec![vec![], vec![]]);
        empty.seek_to_first();
        assert!(!empty.valid());
        empty.seek_to_last();
        assert!(!empty.valid());
    }

    #[test]
    fn test_empty_iter_reports_error() {
        let it = EmptyIter::with_error(Error::corruption("boom"));
        assert!(!it.valid());
        assert!(it.status().is_err());
        assert!(EmptyIter::new().status().is_ok());
    }
}
