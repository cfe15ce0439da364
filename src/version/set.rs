//! The version set: publishes new versions, owns the manifest, and picks
//! compactions.
//!
//! The manifest is an append-only log (WAL framing) of serialized
//! `VersionEdit`s; `CURRENT` names the live manifest file. Applying an
//! edit to the current version yields the next one; old versions stay
//! alive while an iterator or compaction still holds them and are pruned
//! afterwards.
//!
//! Because manifest appends must happen with the DB mutex released, the
//! apply is split: `prepare_log_and_apply` builds the new version and
//! the records under the mutex, the caller performs the file IO without
//! it, and `install_log_and_apply` publishes (or discards) the result.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::{Options, ReadOptions};
use crate::env::{read_file_to_string, Env};
use crate::error::{Error, Result};
use crate::iterator::{Iter, MergingIter, TwoLevelIter};
use crate::keys::{InternalKey, InternalKeyComparator, SequenceNumber};
use crate::table_cache::TableCache;
use crate::util::coding::decode_fixed64;
use crate::util::comparator::Comparator;
use crate::wal;

use super::edit::VersionEdit;
use super::{
    expanded_compaction_byte_size_limit, max_bytes_for_level,
    max_file_size_for_level, max_grandparent_overlap_bytes, total_file_size, FileMetaData,
    Version, L0_COMPACTION_TRIGGER, NUM_LEVELS,
};

pub struct VersionSet {
    dbname: PathBuf,
    env: Arc<dyn Env>,
    options: Options,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,

    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: SequenceNumber,
    log_number: u64,
    /// Zero, or the number of the log for the immutable memtable.
    prev_log_number: u64,

    /// Whether a manifest file is open for append (the writer itself is
    /// held by the engine so appends can happen outside the DB mutex).
    has_manifest: bool,

    /// All versions still referenced somewhere; `current` is the newest.
    versions: Vec<Arc<Version>>,
    current: Arc<Version>,

    /// Per level: the largest internal key of the last compaction there,
    /// used to rotate compaction work around the keyspace.
    compact_pointer: Vec<Vec<u8>>,
}

/// The IO a `prepare_log_and_apply` call deferred: records to append to
/// the manifest and, on first use, the manifest to create.
pub struct ManifestWrite {
    version: Arc<Version>,
    pub manifest_number: u64,
    pub create_manifest: bool,
    pub snapshot_record: Option<Vec<u8>>,
    pub edit_record: Vec<u8>,
    log_number: u64,
    prev_log_number: u64,
}

/// What `recover` learned beyond the version state.
pub struct RecoverOutcome {
    /// True when the caller must write a fresh manifest via
    /// `prepare_log_and_apply` before accepting writes.
    pub save_manifest: bool,
    /// An append handle to the reused manifest, when reuse applied.
    pub manifest_writer: Option<wal::Writer>,
}

impl VersionSet {
    pub fn new(
        dbname: PathBuf,
        options: Options,
        icmp: InternalKeyComparator,
        table_cache: Arc<TableCache>,
    ) -> Self {
        let env = options.env.clone();
        let current = Arc::new(Version::new(icmp.clone()));
        VersionSet {
            dbname,
            env,
            options,
            icmp,
            table_cache,
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            has_manifest: false,
            versions: vec![Arc::clone(&current)],
            current,
            compact_pointer: vec![Vec::new(); NUM_LEVELS],
        }
    }

    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    pub fn icmp(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    pub fn table_cache(&self) -> &Arc<TableCache> {
        &self.table_cache
    }

    pub fn new_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    /// Hands back an unused file number so it can be reallocated.
    pub fn reuse_file_number(&mut self, number: u64) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, seq: SequenceNumber) {
        debug_assert!(seq >= self.last_sequence);
        self.last_sequence = seq;
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.files[level].len()
    }

    pub fn num_level_bytes(&self, level: usize) -> u64 {
        total_file_size(&self.current.files[level])
    }

    /// Stage an edit: build its version and serialize the records. The
    /// caller appends them to the manifest (mutex released) and then
    /// calls `install_log_and_apply` with the outcome.
    pub fn prepare_log_and_apply(&mut self, edit: &mut VersionEdit) -> ManifestWrite {
        match edit.log_number {
            Some(n) => {
                debug_assert!(n >= self.log_number);
                debug_assert!(n < self.next_file_number);
            }
            None => edit.set_log_number(self.log_number),
        }
        if edit.prev_log_number.is_none() {
            edit.set_prev_log_number(self.prev_log_number);
        }
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let mut version = Version::new(self.icmp.clone());
        {
            let mut builder = Builder::new(self.icmp.clone(), self.current());
            self.apply_to_builder(edit, &mut builder);
            builder.save_to(&mut version);
        }
        finalize(&mut version);

        let create_manifest = !self.has_manifest;
        let snapshot_record = if create_manifest {
            // A fresh manifest starts with a snapshot of the state it
            // was created from.
            let snapshot = self.snapshot_edit();
            let mut record = Vec::new();
            snapshot.encode_to(&mut record);
            Some(record)
        } else {
            None
        };
        let mut edit_record = Vec::new();
        edit.encode_to(&mut edit_record);

        ManifestWrite {
            version: Arc::new(version),
            manifest_number: self.manifest_file_number,
            create_manifest,
            snapshot_record,
            edit_record,
            log_number: edit.log_number.unwrap(),
            prev_log_number: edit.prev_log_number.unwrap(),
        }
    }

    /// Publishes the staged version, or discards it when the manifest
    /// write failed.
    pub fn install_log_and_apply(&mut self, write: ManifestWrite, io_ok: bool) {
        if io_ok {
            self.versions.push(Arc::clone(&write.version));
            self.current = write.version;
            self.log_number = write.log_number;
            self.prev_log_number = write.prev_log_number;
            self.has_manifest = true;
            self.prune_versions();
        }
    }

    fn apply_to_builder(&mut self, edit: &VersionEdit, builder: &mut Builder) {
        for (level, key) in &edit.compact_pointers {
            self.compact_pointer[*level] = key.encoded().to_vec();
        }
        builder.apply_files(edit);
    }

    /// Drops versions nothing references anymore (list-only).
    fn prune_versions(&mut self) {
        let current = Arc::clone(&self.current);
        self.versions
            .retain(|v| Arc::ptr_eq(v, &current) || Arc::strong_count(v) > 1);
    }

    /// Table files referenced by any live version, plus nothing else.
    pub fn add_live_files(&mut self, live: &mut HashSet<u64>) {
        self.prune_versions();
        for version in &self.versions {
            for level in 0..NUM_LEVELS {
                for f in &version.files[level] {
                    live.insert(f.number);
                }
            }
        }
    }

    /// Recovers state from `CURRENT` and the manifest it names.
    pub fn recover(&mut self) -> Result<RecoverOutcome> {
        let current_path = crate::db::filename::current_file_name(&self.dbname);
        let mut current_contents = read_file_to_string(self.env.as_ref(), &current_path)?;
        if current_contents.is_empty() || !current_contents.ends_with('\n') {
            return Err(Error::corruption("CURRENT file does not end with newline"));
        }
        current_contents.pop();
        let manifest_path = self.dbname.join(&current_contents);

        let file = self.env.new_sequential_file(&manifest_path)?;

        struct ManifestReporter {
            error: Arc<Mutex<Option<Error>>>,
        }
        impl wal::Reporter for ManifestReporter {
            fn corruption(&mut self, _bytes: usize, reason: &str) {
                let mut slot = self.error.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(Error::corruption(format!("manifest: {reason}")));
                }
            }
        }
        let error = Arc::new(Mutex::new(None));
        let mut reader = wal::Reader::new(
            file,
            Some(Box::new(ManifestReporter {
                error: Arc::clone(&error),
            })),
            true,
            0,
        );

        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file = None;
        let mut last_sequence = None;
        let mut builder = Builder::new(self.icmp.clone(), self.current());
        let mut read_records = 0usize;

        while let Some(record) = reader.read_record() {
            read_records += 1;
            let edit = VersionEdit::decode_from(&record)?;
            if let Some(name) = &edit.comparator {
                let expected = self.icmp.user_comparator().name();
                if name != expected {
                    return Err(Error::invalid_argument(format!(
                        "{name} does not match existing comparator {expected}"
                    )));
                }
            }
            self.apply_to_builder(&edit, &mut builder);
            if let Some(n) = edit.log_number {
                log_number = Some(n);
            }
            if let Some(n) = edit.prev_log_number {
                prev_log_number = Some(n);
            }
            if let Some(n) = edit.next_file_number {
                next_file = Some(n);
            }
            if let Some(n) = edit.last_sequence {
                last_sequence = Some(n);
            }
        }
        if let Some(e) = error.lock().unwrap().take() {
            // The version state is the database; a damaged manifest is
            // never silently patched over.
            return Err(e);
        }

        let next_file =
            next_file.ok_or_else(|| Error::corruption("no meta-nextfile entry in manifest"))?;
        let log_number =
            log_number.ok_or_else(|| Error::corruption("no meta-lognumber entry in manifest"))?;
        let last_sequence = last_sequence
            .ok_or_else(|| Error::corruption("no last-sequence-number entry in manifest"))?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        self.next_file_number = next_file;
        self.mark_file_number_used(prev_log_number);
        self.mark_file_number_used(log_number);

        let mut version = Version::new(self.icmp.clone());
        builder.save_to(&mut version);
        finalize(&mut version);
        let version = Arc::new(version);
        self.versions.push(Arc::clone(&version));
        self.current = version;
        self.prune_versions();
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;

        tracing::debug!(
            manifest = %manifest_path.display(),
            records = read_records,
            next_file,
            last_sequence,
            "recovered version state"
        );

        // Optionally keep appending to the existing manifest instead of
        // rewriting it.
        if let Some(writer) = self.maybe_reuse_manifest(&manifest_path, &current_contents) {
            return Ok(RecoverOutcome {
                save_manifest: false,
                manifest_writer: Some(writer),
            });
        }
        self.manifest_file_number = self.new_file_number();
        Ok(RecoverOutcome {
            save_manifest: true,
            manifest_writer: None,
        })
    }

    fn maybe_reuse_manifest(
        &mut self,
        manifest_path: &std::path::Path,
        manifest_name: &str,
    ) -> Option<wal::Writer> {
        if !self.options.reuse_logs {
            return None;
        }
        let (number, file_type) = crate::db::filename::parse_file_name(manifest_name)?;
        if file_type != crate::db::filename::FileType::Descriptor {
            return None;
        }
        let size = self.env.file_size(manifest_path).ok()?;
        // An oversized manifest is rewritten to stay compact.
        if size >= max_file_size_for_level(&self.options, 0) {
            return None;
        }
        let file = self.env.new_appendable_file(manifest_path).ok()?;
        tracing::info!(manifest = %manifest_path.display(), "reusing manifest");
        self.manifest_file_number = number;
        self.has_manifest = true;
        Some(wal::Writer::with_dest_length(file, size))
    }

    /// An edit capturing the entire current state, used as the first
    /// record of a fresh manifest.
    fn snapshot_edit(&self) -> VersionEdit {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.icmp.user_comparator().name());
        for (level, pointer) in self.compact_pointer.iter().enumerate() {
            if !pointer.is_empty() {
                if let Ok(key) = InternalKey::decode_from(pointer) {
                    edit.set_compact_pointer(level, key);
                }
            }
        }
        for level in 0..NUM_LEVELS {
            for f in &self.current.files[level] {
                edit.add_file(
                    level,
                    f.number,
                    f.file_size,
                    f.smallest.clone(),
                    f.largest.clone(),
                );
            }
        }
        edit
    }

    pub fn needs_compaction(&self) -> bool {
        self.current.compaction_score >= 1.0 || self.current.file_to_compact().is_some()
    }

    /// Picks the next compaction: size-triggered first (by the score
    /// computed in `finalize`), else seek-triggered. None when the tree
    /// is healthy.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = self.current();
        let size_compaction = current.compaction_score >= 1.0;

        let mut c;
        if size_compaction {
            let level = current.compaction_level.expect("score without level");
            debug_assert!(level + 1 < NUM_LEVELS);
            c = Compaction::new(&self.options, self.icmp.clone(), level);

            // Resume after the last key compacted at this level, wrapping
            // to the start when exhausted.
            let pointer = &self.compact_pointer[level];
            let picked = current.files[level].iter().find(|f| {
                pointer.is_empty()
                    || self.icmp.compare(f.largest.encoded(), pointer) == Ordering::Greater
            });
            let picked = picked.or_else(|| current.files[level].first());
            c.inputs[0].push(Arc::clone(picked?));
        } else if let Some((f, level)) = current.file_to_compact() {
            c = Compaction::new(&self.options, self.icmp.clone(), level);
            c.inputs[0].push(f);
        } else {
            return None;
        }

        c.input_version = Some(Arc::clone(&current));

        // Level-0 files overlap each other: widen to every file touching
        // the picked range.
        if c.level == 0 {
            let smallest = c.inputs[0][0].smallest.clone();
            let largest = c.inputs[0][0].largest.clone();
            c.inputs[0] = current.get_overlapping_inputs(0, Some(&smallest), Some(&largest));
            debug_assert!(!c.inputs[0].is_empty());
        }

        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /// Manual compaction of `[begin, end]` at `level`. Large ranges at
    /// levels above zero are truncated to one file-size unit of inputs;
    /// the caller loops.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction> {
        let current = self.current();
        let mut inputs = current.get_overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        if level > 0 {
            let limit = max_file_size_for_level(&self.options, level);
            let mut total = 0;
            for i in 0..inputs.len() {
                total += inputs[i].file_size;
                if total >= limit {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }

        let mut c = Compaction::new(&self.options, self.icmp.clone(), level);
        c.input_version = Some(current);
        c.inputs[0] = inputs;
        self.setup_other_inputs(&mut c);
        Some(c)
    }

    fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let current = c.input_version.clone().expect("compaction has no version");
        let level = c.level;

        add_boundary_inputs(&self.icmp, &current.files[level], &mut c.inputs[0]);
        let (smallest, largest) = self.key_range(&c.inputs[0]);

        c.inputs[1] =
            current.get_overlapping_inputs(level + 1, Some(&smallest), Some(&largest));
        add_boundary_inputs(&self.icmp, &current.files[level + 1], &mut c.inputs[1]);

        let (mut all_start, mut all_limit) =
            self.key_range_2(&c.inputs[0], &c.inputs[1]);

        // Try growing the level-L input set without pulling in more
        // level-L+1 files, so one pass compacts more data.
        if !c.inputs[1].is_empty() {
            let mut expanded0 =
                current.get_overlapping_inputs(level, Some(&all_start), Some(&all_limit));
            add_boundary_inputs(&self.icmp, &current.files[level], &mut expanded0);
            let inputs0_size = total_file_size(&c.inputs[0]);
            let inputs1_size = total_file_size(&c.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > c.inputs[0].len()
                && inputs1_size + expanded0_size
                    < expanded_compaction_byte_size_limit(&self.options)
            {
                let (new_start, new_limit) = self.key_range(&expanded0);
                let mut expanded1 = current.get_overlapping_inputs(
                    level + 1,
                    Some(&new_start),
                    Some(&new_limit),
                );
                add_boundary_inputs(&self.icmp, &current.files[level + 1], &mut expanded1);
                if expanded1.len() == c.inputs[1].len() {
                    tracing::info!(
                        level,
                        from_files = c.inputs[0].len(),
                        to_files = expanded0.len(),
                        from_bytes = inputs0_size,
                        to_bytes = expanded0_size,
                        "expanding compaction inputs"
                    );
                    c.inputs[0] = expanded0;
                    c.inputs[1] = expanded1;
                    let range = self.key_range_2(&c.inputs[0], &c.inputs[1]);
                    all_start = range.0;
                    all_limit = range.1;
                }
            }
        }

        // Grandparent overlap bounds output file size during the merge.
        if level + 2 < NUM_LEVELS {
            c.grandparents =
                current.get_overlapping_inputs(level + 2, Some(&all_start), Some(&all_limit));
        }

        // Future compactions at this level resume past this range even
        // if this one later fails and retries.
        let (_, largest) = self.key_range(&c.inputs[0]);
        self.compact_pointer[level] = largest.encoded().to_vec();
        c.edit.set_compact_pointer(level, largest);
    }

    fn key_range(&self, files: &[Arc<FileMetaData>]) -> (InternalKey, InternalKey) {
        debug_assert!(!files.is_empty());
        let mut smallest = files[0].smallest.clone();
        let mut largest = files[0].largest.clone();
        for f in &files[1..] {
            if self.icmp.compare_internal_keys(&f.smallest, &smallest) == Ordering::Less {
                smallest = f.smallest.clone();
            }
            if self.icmp.compare_internal_keys(&f.largest, &largest) == Ordering::Greater {
                largest = f.largest.clone();
            }
        }
        (smallest, largest)
    }

    fn key_range_2(
        &self,
        a: &[Arc<FileMetaData>],
        b: &[Arc<FileMetaData>],
    ) -> (InternalKey, InternalKey) {
        let mut all: Vec<Arc<FileMetaData>> = a.to_vec();
        all.extend_from_slice(b);
        self.key_range(&all)
    }

    /// A merged iterator over everything a compaction reads.
    pub fn make_input_iterator(&self, c: &Compaction) -> Box<dyn Iter> {
        let read_options = ReadOptions {
            verify_checksums: self.options.paranoid_checks,
            fill_cache: false,
            snapshot: None,
        };

        let mut children: Vec<Box<dyn Iter>> = Vec::new();
        for which in 0..2 {
            if c.inputs[which].is_empty() {
                continue;
            }
            if c.level + which == 0 {
                for f in &c.inputs[which] {
                    children.push(self.table_cache.new_iterator(
                        &read_options,
                        f.number,
                        f.file_size,
                    ));
                }
            } else {
                children.push(concat_files_iterator(
                    self.icmp.clone(),
                    c.inputs[which].clone(),
                    Arc::clone(&self.table_cache),
                    read_options.clone(),
                ));
            }
        }
        let cmp: Arc<dyn Comparator> = Arc::new(self.icmp.clone());
        Box::new(MergingIter::new(cmp, children))
    }

    /// Approximate byte offset of `ikey` within the whole database as of
    /// version `v`.
    pub fn approximate_offset_of(&self, v: &Version, ikey: &InternalKey) -> u64 {
        let mut result = 0;
        for level in 0..NUM_LEVELS {
            for f in &v.files[level] {
                if self.icmp.compare(f.largest.encoded(), ikey.encoded()) != Ordering::Greater {
                    // Entirely before ikey.
                    result += f.file_size;
                } else if self.icmp.compare(f.smallest.encoded(), ikey.encoded())
                    == Ordering::Greater
                {
                    // Entirely after.
                    if level > 0 {
                        break;
                    }
                } else {
                    result += self.table_cache.approximate_offset_of(
                        f.number,
                        f.file_size,
                        ikey.encoded(),
                    );
                }
            }
        }
        result
    }

    /// One line per level for the stats property.
    pub fn level_summary(&self) -> String {
        let counts: Vec<String> = self
            .current
            .files
            .iter()
            .map(|f| f.len().to_string())
            .collect();
        format!("files[ {} ]", counts.join(" "))
    }
}

/// Computes the next size-triggered compaction for `v`: level 0 scores
/// by file count, deeper levels by bytes against their budget.
pub fn finalize(v: &mut Version) {
    let mut best_level = None;
    let mut best_score = -1.0f64;

    for level in 0..NUM_LEVELS - 1 {
        let score = if level == 0 {
            // File count, not bytes: every level-0 file widens reads, and
            // small write buffers must not cause a compaction storm.
            v.files[0].len() as f64 / L0_COMPACTION_TRIGGER as f64
        } else {
            total_file_size(&v.files[level]) as f64 / max_bytes_for_level(level)
        };
        if score > best_score {
            best_level = Some(level);
            best_score = score;
        }
    }

    v.compaction_level = best_level;
    v.compaction_score = best_score;
}

/// Extends `compaction_files` with same-level files whose smallest key
/// shares a user key with the picked set's largest. Without this, two
/// files holding different sequences of one user key could be compacted
/// separately, resurrecting an older value.
pub fn add_boundary_inputs(
    icmp: &InternalKeyComparator,
    level_files: &[Arc<FileMetaData>],
    compaction_files: &mut Vec<Arc<FileMetaData>>,
) {
    let mut largest_key = match largest_key_of(icmp, compaction_files) {
        Some(key) => key,
        None => return,
    };

    while let Some(boundary) = find_smallest_boundary_file(icmp, level_files, &largest_key) {
        largest_key = boundary.largest.clone();
        compaction_files.push(boundary);
    }
}

fn largest_key_of(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetaData>],
) -> Option<InternalKey> {
    let mut largest: Option<&InternalKey> = None;
    for f in files {
        match largest {
            None => largest = Some(&f.largest),
            Some(key) => {
                if icmp.compare_internal_keys(&f.largest, key) == Ordering::Greater {
                    largest = Some(&f.largest);
                }
            }
        }
    }
    largest.cloned()
}

/// The file with the smallest `smallest` key that starts with the same
/// user key as `largest_key` but after it (an older sequence).
fn find_smallest_boundary_file(
    icmp: &InternalKeyComparator,
    level_files: &[Arc<FileMetaData>],
    largest_key: &InternalKey,
) -> Option<Arc<FileMetaData>> {
    let ucmp = icmp.user_comparator();
    let mut smallest: Option<&Arc<FileMetaData>> = None;
    for f in level_files {
        if icmp.compare_internal_keys(&f.smallest, largest_key) == Ordering::Greater
            && ucmp.compare(f.smallest.user_key(), largest_key.user_key()) == Ordering::Equal
        {
            match smallest {
                None => smallest = Some(f),
                Some(best) => {
                    if icmp.compare_internal_keys(&f.smallest, &best.smallest)
                        == Ordering::Less
                    {
                        smallest = Some(f);
                    }
                }
            }
        }
    }
    smallest.cloned()
}

/// Chains a sorted, disjoint file list into one iterator.
pub fn concat_files_iterator(
    icmp: InternalKeyComparator,
    files: Vec<Arc<FileMetaData>>,
    table_cache: Arc<TableCache>,
    read_options: ReadOptions,
) -> Box<dyn Iter> {
    let index = super::LevelFileNumIterator::new(icmp, files);
    Box::new(TwoLevelIter::new(
        Box::new(index),
        Box::new(move |file_value: &[u8]| {
            if file_value.len() != 16 {
                return Box::new(crate::iterator::EmptyIter::with_error(
                    Error::corruption("bad level file entry"),
                )) as Box<dyn Iter>;
            }
            let number = decode_fixed64(&file_value[..8]);
            let size = decode_fixed64(&file_value[8..]);
            table_cache.new_iterator(&read_options, number, size)
        }),
    ))
}

/// Accumulates edits on top of a base version.
struct Builder {
    icmp: InternalKeyComparator,
    base: Arc<Version>,
    levels: Vec<LevelState>,
}

#[derive(Default)]
struct LevelState {
    deleted: HashSet<u64>,
    added: Vec<Arc<FileMetaData>>,
}

impl Builder {
    fn new(icmp: InternalKeyComparator, base: Arc<Version>) -> Self {
        Builder {
            icmp,
            base,
            levels: (0..NUM_LEVELS).map(|_| LevelState::default()).collect(),
        }
    }

    fn apply_files(&mut self, edit: &VersionEdit) {
        for (level, number) in &edit.deleted_files {
            self.levels[*level].deleted.insert(*number);
        }
        for (level, meta) in &edit.new_files {
            self.levels[*level].deleted.remove(&meta.number);
            self.levels[*level].added.push(Arc::new(meta.clone()));
        }
    }

    fn save_to(&mut self, v: &mut Version) {
        let by_smallest = |icmp: &InternalKeyComparator,
                           a: &Arc<FileMetaData>,
                           b: &Arc<FileMetaData>| {
            icmp.compare_internal_keys(&a.smallest, &b.smallest)
                .then(a.number.cmp(&b.number))
        };

        for level in 0..NUM_LEVELS {
            let mut added = std::mem::take(&mut self.levels[level].added);
            added.sort_by(|a, b| by_smallest(&self.icmp, a, b));

            // Merge base (already sorted) with the sorted additions.
            let base_files = &self.base.files[level];
            let mut base_iter = base_files.iter().peekable();
            for add in added {
                while let Some(&b) = base_iter.peek() {
                    if by_smallest(&self.icmp, b, &add) == Ordering::Less {
                        self.maybe_add_file(v, level, Arc::clone(b));
                        base_iter.next();
                    } else {
                        break;
                    }
                }
                self.maybe_add_file(v, level, add);
            }
            for b in base_iter {
                self.maybe_add_file(v, level, Arc::clone(b));
            }

            if level > 0 {
                // Disjointness is a structural invariant for every level
                // above zero.
                for pair in v.files[level].windows(2) {
                    assert!(
                        self.icmp
                            .compare_internal_keys(&pair[0].largest, &pair[1].smallest)
                            == Ordering::Less,
                        "overlapping ranges in level {level}"
                    );
                }
            }
        }
    }

    fn maybe_add_file(&self, v: &mut Version, level: usize, f: Arc<FileMetaData>) {
        if self.levels[level].deleted.contains(&f.number) {
            return;
        }
        v.files[level].push(f);
    }
}


/// A staged two-level merge: the files being read, the edit that will
/// install its outputs, and the cursors that bound output file size by
/// grandparent overlap.
pub struct Compaction {
    level: usize,
    max_output_file_size: u64,
    grandparent_limit: u64,
    pub input_version: Option<Arc<Version>>,
    pub edit: VersionEdit,
    pub inputs: [Vec<Arc<FileMetaData>>; 2],

    grandparents: Vec<Arc<FileMetaData>>,
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,

    icmp: InternalKeyComparator,
    /// Per-level cursors for `is_base_level_for_key`; valid because keys
    /// arrive in increasing order.
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    fn new(options: &Options, icmp: InternalKeyComparator, level: usize) -> Self {
        Compaction {
            level,
            max_output_file_size: max_file_size_for_level(options, level),
            grandparent_limit: max_grandparent_overlap_bytes(options),
            input_version: None,
            edit: VersionEdit::new(),
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            icmp,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    pub fn input(&self, which: usize, i: usize) -> &Arc<FileMetaData> {
        &self.inputs[which][i]
    }

    /// A move-only compaction: one input file, nothing to merge with,
    /// and modest grandparent overlap (else a later L+1→L+2 compaction
    /// would be very expensive).
    pub fn is_trivial_move(&self) -> bool {
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents) <= self.grandparent_limit
    }

    /// Marks every input file deleted in the edit.
    pub fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for f in &self.inputs[which] {
                self.edit.remove_file(self.level + which, f.number);
            }
        }
    }

    /// True when no level below the compaction output can contain
    /// `user_key`, so its tombstones can be dropped. Keys must arrive in
    /// increasing order across calls.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        let version = match &self.input_version {
            Some(v) => v,
            None => return false,
        };
        let ucmp = self.icmp.user_comparator().clone();
        for level in self.level + 2..NUM_LEVELS {
            let files = &version.files[level];
            while self.level_ptrs[level] < files.len() {
                let f = &files[self.level_ptrs[level]];
                if ucmp.compare(user_key, f.largest.user_key()) != Ordering::Greater {
                    if ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// True when the current output should be closed before adding
    /// `internal_key`, to keep any output file's overlap with level L+2
    /// bounded.
    pub fn should_stop_before(&mut self, internal_key: &[u8]) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && self.icmp.compare(
                internal_key,
                self.grandparents[self.grandparent_index].largest.encoded(),
            ) == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.grandparent_limit {
            self.overlapped_bytes = 0;
            return true;
        }
        false
    }

    /// Drops the pin on the input version once the compaction outcome is
    /// installed.
    pub fn release_inputs(&mut self) {
        self.input_version = None;
    }
}
