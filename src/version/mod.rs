//! Versions: immutable snapshots of the on-disk file set.
//!
//! A version lists the table files of each level. Level 0 files may
//! overlap one another and are consulted newest-first; every higher
//! level is a sorted run of disjoint user-key ranges. Versions are
//! shared via `Arc`: readers, iterators, and compactions pin the version
//! they started from while the version set moves on.

pub mod edit;
pub mod set;

use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, Ordering as MemOrder};
use std::sync::{Arc, Mutex};

use crate::config::{Options, ReadOptions};
use crate::error::Result;
use crate::iterator::{Iter, TwoLevelIter};
use crate::keys::{
    InternalKey, InternalKeyComparator, LookupKey, ValueType, MAX_SEQUENCE_NUMBER,
    VALUE_TYPE_FOR_SEEK,
};
use crate::table_cache::TableCache;
use crate::util::coding::{decode_fixed64, put_fixed64};
use crate::util::comparator::Comparator;

pub const NUM_LEVELS: usize = 7;

/// Level-0 file count that triggers a compaction.
pub const L0_COMPACTION_TRIGGER: usize = 4;
/// Level-0 file count at which writes are briefly slowed.
pub const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;
/// Level-0 file count at which writes stop until compaction catches up.
pub const L0_STOP_WRITES_TRIGGER: usize = 12;
/// Highest level a fresh memtable flush may be pushed to.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

pub fn max_file_size_for_level(options: &Options, _level: usize) -> u64 {
    // Same target at every level for now.
    options.max_file_size as u64
}

pub fn max_grandparent_overlap_bytes(options: &Options) -> u64 {
    10 * max_file_size_for_level(options, 0)
}

pub fn expanded_compaction_byte_size_limit(options: &Options) -> u64 {
    25 * max_file_size_for_level(options, 0)
}

pub fn max_bytes_for_level(level: usize) -> f64 {
    // Level 0 is scored by file count, not bytes; level 1 and below grow
    // by a factor of ten.
    let mut result = 10.0 * 1048576.0;
    let mut level = level.max(1);
    while level > 1 {
        result *= 10.0;
        level -= 1;
    }
    result
}

pub fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

#[derive(Debug)]
pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    /// Seek-miss budget before the file volunteers for compaction.
    pub allowed_seeks: AtomicI64,
}

impl FileMetaData {
    pub fn new(number: u64, file_size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        // One seek costs roughly what compacting 16KiB costs, so a file
        // earns one allowed seek per 16KiB, floored to keep small files
        // from thrashing.
        let allowed_seeks = (file_size / 16384).max(100) as i64;
        FileMetaData {
            number,
            file_size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(allowed_seeks),
        }
    }
}

impl Clone for FileMetaData {
    fn clone(&self) -> Self {
        FileMetaData {
            number: self.number,
            file_size: self.file_size,
            smallest: self.smallest.clone(),
            largest: self.largest.clone(),
            allowed_seeks: AtomicI64::new(self.allowed_seeks.load(MemOrder::Relaxed)),
        }
    }
}

/// Outcome bookkeeping for `Version::get`: which file burned a seek
/// without answering.
#[derive(Default)]
pub struct GetStats {
    pub seek_file: Option<(Arc<FileMetaData>, usize)>,
}

pub struct Version {
    icmp: InternalKeyComparator,
    pub files: Vec<Vec<Arc<FileMetaData>>>,

    /// Filled in by `set::finalize`.
    pub compaction_score: f64,
    pub compaction_level: Option<usize>,

    /// Seek-triggered compaction candidate, set under the DB mutex.
    file_to_compact: Mutex<Option<(Arc<FileMetaData>, usize)>>,
}

impl Version {
    pub fn new(icmp: InternalKeyComparator) -> Self {
        Version {
            icmp,
            files: vec![Vec::new(); NUM_LEVELS],
            compaction_score: -1.0,
            compaction_level: None,
            file_to_compact: Mutex::new(None),
        }
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub fn file_to_compact(&self) -> Option<(Arc<FileMetaData>, usize)> {
        self.file_to_compact.lock().unwrap().clone()
    }

    /// Files at each level whose range may contain `user_key`, visited
    /// newest-first. Stops early when `visit` returns false.
    fn for_each_overlapping(
        &self,
        user_key: &[u8],
        internal_key: &[u8],
        mut visit: impl FnMut(usize, &Arc<FileMetaData>) -> bool,
    ) {
        let ucmp = self.icmp.user_comparator().clone();

        let mut level0: Vec<&Arc<FileMetaData>> = self.files[0]
            .iter()
            .filter(|f| {
                ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less
                    && ucmp.compare(user_key, f.largest.user_key()) != Ordering::Greater
            })
            .collect();
        level0.sort_by(|a, b| b.number.cmp(&a.number));
        for f in level0 {
            if !visit(0, f) {
                return;
            }
        }

        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }
            let index = find_file(&self.icmp, files, internal_key);
            if index < files.len() {
                let f = &files[index];
                if ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less
                    && !visit(level, f)
                {
                    return;
                }
            }
        }
    }

    /// Point lookup across the file set at this version. Returns the
    /// value (or None for absent/deleted) plus seek-charging stats the
    /// caller applies under the DB mutex.
    pub fn get(
        &self,
        read_options: &ReadOptions,
        key: &LookupKey,
        table_cache: &TableCache,
    ) -> (Result<Option<Vec<u8>>>, GetStats) {
        enum Saver {
            NotFound,
            Found(Vec<u8>),
            Deleted,
            Corrupt,
        }

        let ikey = key.internal_key();
        let user_key = key.user_key();
        let ucmp = self.icmp.user_comparator().clone();

        let mut stats = GetStats::default();
        let mut last_file_read: Option<(Arc<FileMetaData>, usize)> = None;
        let mut result: Option<Result<Option<Vec<u8>>>> = None;

        self.for_each_overlapping(user_key, ikey, |level, f| {
            if stats.seek_file.is_none() && last_file_read.is_some() {
                // A second file is being consulted for this read; charge
                // the first one a seek.
                stats.seek_file = last_file_read.take();
            }
            last_file_read = Some((Arc::clone(f), level));

            let mut saver = Saver::NotFound;
            let status = table_cache.get(
                read_options,
                f.number,
                f.file_size,
                ikey,
                &mut |found_key, found_value| {
                    match crate::keys::parse_internal_key(found_key) {
                        None => saver = Saver::Corrupt,
                        Some(parsed) => {
                            if ucmp.compare(parsed.user_key, user_key) == Ordering::Equal {
                                saver = match parsed.value_type {
                                    ValueType::Value => Saver::Found(found_value.to_vec()),
                                    ValueType::Deletion => Saver::Deleted,
                                };
                            }
                        }
                    }
                },
            );

            match status {
                Err(e) => {
                    result = Some(Err(e));
                    false
                }
                Ok(()) => match saver {
                    Saver::NotFound => true,
                    Saver::Found(value) => {
                        result = Some(Ok(Some(value)));
                        false
                    }
                    Saver::Deleted => {
                        result = Some(Ok(None));
                        false
                    }
                    Saver::Corrupt => {
                        result = Some(Err(crate::error::Error::corruption(format!(
                            "corrupted key for {}",
                            String::from_utf8_lossy(user_key)
                        ))));
                        false
                    }
                },
            }
        });

        (result.unwrap_or(Ok(None)), stats)
    }

    /// Applies the seek charge from a `get`. Returns true when a
    /// compaction of the charged file should be scheduled. Caller holds
    /// the DB mutex.
    pub fn update_stats(&self, stats: GetStats) -> bool {
        if let Some((f, level)) = stats.seek_file {
            if f.allowed_seeks.fetch_sub(1, MemOrder::Relaxed) <= 1 {
                let mut candidate = self.file_to_compact.lock().unwrap();
                if candidate.is_none() {
                    *candidate = Some((f, level));
                    return true;
                }
            }
        }
        false
    }

    /// Called roughly once per megabyte of iterated data. When a key
    /// overlaps two or more files the oldest is charged a seek, so long
    /// scans over cold overlapping files eventually trigger compaction.
    pub fn record_read_sample(&self, internal_key: &[u8]) -> bool {
        let parsed = match crate::keys::parse_internal_key(internal_key) {
            Some(parsed) => parsed,
            None => return false,
        };

        let mut first: Option<(Arc<FileMetaData>, usize)> = None;
        let mut matches = 0;
        self.for_each_overlapping(parsed.user_key, internal_key, |level, f| {
            matches += 1;
            if matches == 1 {
                first = Some((Arc::clone(f), level));
            }
            matches < 2
        });

        if matches >= 2 {
            return self.update_stats(GetStats { seek_file: first });
        }
        false
    }

    /// True when any file at `level` overlaps `[smallest, largest]` in
    /// user-key space. None means unbounded on that side.
    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest_user_key: Option<&[u8]>,
        largest_user_key: Option<&[u8]>,
    ) -> bool {
        some_file_overlaps_range(
            &self.icmp,
            level > 0,
            &self.files[level],
            smallest_user_key,
            largest_user_key,
        )
    }

    /// Picks the level for a fresh memtable flush covering the given
    /// range: pushed below level 0 while it overlaps nothing there and
    /// the grandparent overlap stays modest.
    pub fn pick_level_for_memtable_output(
        &self,
        options: &Options,
        smallest_user_key: &[u8],
        largest_user_key: &[u8],
    ) -> usize {
        let mut level = 0;
        if !self.overlap_in_level(0, Some(smallest_user_key), Some(largest_user_key)) {
            let start = InternalKey::new(smallest_user_key, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
            let limit = InternalKey::new(largest_user_key, 0, ValueType::Deletion);
            while level < MAX_MEM_COMPACT_LEVEL {
                if self.overlap_in_level(
                    level + 1,
                    Some(smallest_user_key),
                    Some(largest_user_key),
                ) {
                    break;
                }
                if level + 2 < NUM_LEVELS {
                    let overlaps =
                        self.get_overlapping_inputs(level + 2, Some(&start), Some(&limit));
                    if total_file_size(&overlaps) > max_grandparent_overlap_bytes(options) {
                        break;
                    }
                }
                level += 1;
            }
        }
        level
    }

    /// All files at `level` whose range touches `[begin, end]`. For
    /// level 0 the range grows to cover any overlapping file (they may
    /// overlap each other), restarting the scan when it does.
    pub fn get_overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetaData>> {
        let ucmp = self.icmp.user_comparator().clone();
        let mut user_begin = begin.map(|k| k.user_key().to_vec());
        let mut user_end = end.map(|k| k.user_key().to_vec());

        let mut inputs: Vec<Arc<FileMetaData>> = Vec::new();
        let mut i = 0;
        while i < self.files[level].len() {
            let f = Arc::clone(&self.files[level][i]);
            i += 1;
            let file_start = f.smallest.user_key();
            let file_limit = f.largest.user_key();
            if user_begin
                .as_deref()
                .is_some_and(|b| ucmp.compare(file_limit, b) == Ordering::Less)
            {
                continue;
            }
            if user_end
                .as_deref()
                .is_some_and(|e| ucmp.compare(file_start, e) == Ordering::Greater)
            {
                continue;
            }

            if level == 0 {
                // Level-0 files overlap each other; widen the range and
                // restart so everything transitively overlapping lands
                // in the input set.
                let mut restart = false;
                if let Some(b) = &user_begin {
                    if ucmp.compare(file_start, b) == Ordering::Less {
                        user_begin = Some(file_start.to_vec());
                        restart = true;
                    }
                }
                if let Some(e) = &user_end {
                    if ucmp.compare(file_limit, e) == Ordering::Greater {
                        user_end = Some(file_limit.to_vec());
                        restart = true;
                    }
                }
                if restart {
                    inputs.clear();
                    i = 0;
                    continue;
                }
            }
            inputs.push(f);
        }
        inputs
    }

    /// Appends iterators that together yield this version's contents.
    pub fn add_iterators(
        &self,
        read_options: &ReadOptions,
        table_cache: &Arc<TableCache>,
        result: &mut Vec<Box<dyn Iter>>,
    ) {
        // Level-0 files may overlap, so each gets its own iterator and
        // the merge sorts it out.
        for f in &self.files[0] {
            result.push(table_cache.new_iterator(read_options, f.number, f.file_size));
        }
        // Sorted levels chain their files behind a file-list index.
        for level in 1..NUM_LEVELS {
            if !self.files[level].is_empty() {
                result.push(self.new_concatenating_iterator(read_options, level, table_cache));
            }
        }
    }

    fn new_concatenating_iterator(
        &self,
        read_options: &ReadOptions,
        level: usize,
        table_cache: &Arc<TableCache>,
    ) -> Box<dyn Iter> {
        let table_cache = Arc::clone(table_cache);
        let read_options = read_options.clone();
        let index = LevelFileNumIterator::new(self.icmp.clone(), self.files[level].clone());
        Box::new(TwoLevelIter::new(
            Box::new(index),
            Box::new(move |file_value: &[u8]| {
                if file_value.len() != 16 {
                    return Box::new(crate::iterator::EmptyIter::with_error(
                        crate::error::Error::corruption("bad level file entry"),
                    ));
                }
                let number = decode_fixed64(&file_value[..8]);
                let size = decode_fixed64(&file_value[8..]);
                table_cache.new_iterator(&read_options, number, size)
            }),
        ))
    }
}

impl std::fmt::Debug for Version {
    /// Compact per-level file counts, e.g. `files[ 2 1 0 0 0 0 0 ]`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "files[")?;
        for files in &self.files {
            write!(f, " {}", files.len())?;
        }
        write!(f, " ]")
    }
}

/// Index of the first file whose largest key is >= `key` (binary search
/// over a sorted, disjoint level).
pub fn find_file(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetaData>],
    key: &[u8],
) -> usize {
    files.partition_point(|f| icmp.compare(f.largest.encoded(), key) == Ordering::Less)
}

fn after_file(ucmp: &Arc<dyn Comparator>, user_key: Option<&[u8]>, f: &FileMetaData) -> bool {
    // None means "infinitely small": not after anything.
    user_key.is_some_and(|k| ucmp.compare(k, f.largest.user_key()) == Ordering::Greater)
}

fn before_file(ucmp: &Arc<dyn Comparator>, user_key: Option<&[u8]>, f: &FileMetaData) -> bool {
    user_key.is_some_and(|k| ucmp.compare(k, f.smallest.user_key()) == Ordering::Less)
}

/// Whether any file overlaps `[smallest, largest]` in user-key space.
/// `disjoint_sorted_files` enables the binary-search fast path.
pub fn some_file_overlaps_range(
    icmp: &InternalKeyComparator,
    disjoint_sorted_files: bool,
    files: &[Arc<FileMetaData>],
    smallest_user_key: Option<&[u8]>,
    largest_user_key: Option<&[u8]>,
) -> bool {
    let ucmp = icmp.user_comparator().clone();
    if !disjoint_sorted_files {
        return files
            .iter()
            .any(|f| !after_file(&ucmp, smallest_user_key, f) && !before_file(&ucmp, largest_user_key, f));
    }

    let index = match smallest_user_key {
        Some(key) => {
            let small = InternalKey::new(key, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
            find_file(icmp, files, small.encoded())
        }
        None => 0,
    };
    if index >= files.len() {
        return false;
    }
    !before_file(&ucmp, largest_user_key, &files[index])
}

/// Iterator over a sorted level's file list. Keys are each file's
/// largest internal key; values encode `(number, size)` as two fixed64s
/// for the two-level glue to open.
pub struct LevelFileNumIterator {
    icmp: InternalKeyComparator,
    files: Vec<Arc<FileMetaData>>,
    index: usize,
    value_buf: Vec<u8>,
}

impl LevelFileNumIterator {
    pub fn new(icmp: InternalKeyComparator, files: Vec<Arc<FileMetaData>>) -> Self {
        let index = files.len();
        LevelFileNumIterator {
            icmp,
            files,
            index,
            value_buf: Vec::with_capacity(16),
        }
    }

    fn fill_value(&mut self) {
        if self.index < self.files.len() {
            let f = &self.files[self.index];
            self.value_buf.clear();
            put_fixed64(&mut self.value_buf, f.number);
            put_fixed64(&mut self.value_buf, f.file_size);
        }
    }
}

impl Iter for LevelFileNumIterator {
    fn valid(&self) -> bool {
        self.index < self.files.len()
    }

    fn seek_to_first(&mut self) {
        self.index = 0;
        self.fill_value();
    }

    fn seek_to_last(&mut self) {
        self.index = if self.files.is_empty() {
            0
        } else {
            self.files.len() - 1
        };
        self.fill_value();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index = find_file(&self.icmp, &self.files, target);
        self.fill_value();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.index += 1;
        self.fill_value();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if self.index == 0 {
            self.index = self.files.len();
        } else {
            self.index -= 1;
            self.fill_value();
        }
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.files[self.index].largest.encoded()
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.value_buf
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}
