//! The database engine.
//!
//! One mutex guards all mutable engine state (`DbState`). It is never
//! held across disk IO: the write path takes the WAL out of the state,
//! appends with the mutex released, and puts it back; flushes and
//! compactions run their merges unlocked; manifest appends happen
//! between a prepare and an install step.
//!
//! Writers queue up and the head of the queue (the leader) commits a
//! whole group of batches with one WAL append, then wakes the others. A
//! single background thread drains the immutable memtable and runs
//! compactions, rescheduling itself while work remains.

pub mod dbiter;
pub mod filename;
pub mod snapshot;

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering as MemOrder};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::batch::WriteBatch;
use crate::config::{Options, ReadOptions, WriteOptions};
use crate::env::{Env, FileLock};
use crate::error::{Error, Result};
use crate::iterator::{Iter, MergingIter};
use crate::keys::{
    InternalFilterPolicy, InternalKey, InternalKeyComparator, LookupKey, SequenceNumber,
    ValueType, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK,
};
use crate::memtable::MemTable;
use crate::sstable::{BlockCache, TableBuilder};
use crate::table_cache::TableCache;
use crate::util::comparator::Comparator;
use crate::version::edit::VersionEdit;
use crate::version::set::{Compaction, VersionSet};
use crate::version::{
    Version, L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER, NUM_LEVELS,
};
use crate::wal;

use dbiter::DbIter;
use filename::{
    current_file_name, descriptor_file_name, lock_file_name, log_file_name, parse_file_name,
    set_current_file, table_file_name, FileType,
};
use snapshot::{Snapshot, SnapshotList};

/// Slots in `max_open_files` reserved for non-table files.
const NUM_NON_TABLE_CACHE_FILES: usize = 10;

type Guard<'a> = MutexGuard<'a, DbState>;

/// A queued write. The leader fills `done` for every ticket it commits.
struct WriteTicket {
    /// None marks a "make room" poke used by `compact_range`.
    batch: Option<WriteBatch>,
    sync: bool,
    done: Mutex<Option<Result<()>>>,
}

struct ManualCompaction {
    level: usize,
    done: bool,
    begin: Option<InternalKey>,
    end: Option<InternalKey>,
}

#[derive(Default, Clone, Copy)]
struct CompactionStats {
    micros: u64,
    bytes_read: u64,
    bytes_written: u64,
}

struct CompactionOutput {
    number: u64,
    file_size: u64,
    smallest: InternalKey,
    largest: InternalKey,
}

struct CompactionState {
    compaction: Compaction,
    /// Entries at or below this sequence that are shadowed can be
    /// dropped; everything newer must survive for live snapshots.
    smallest_snapshot: SequenceNumber,
    outputs: Vec<CompactionOutput>,
    builder: Option<TableBuilder>,
    total_bytes: u64,
}

impl CompactionState {
    fn new(compaction: Compaction, smallest_snapshot: SequenceNumber) -> Self {
        CompactionState {
            compaction,
            smallest_snapshot,
            outputs: Vec::new(),
            builder: None,
            total_bytes: 0,
        }
    }

    fn current_output(&mut self) -> &mut CompactionOutput {
        self.outputs.last_mut().expect("no open compaction output")
    }
}

struct DbState {
    versions: VersionSet,
    mem: Arc<MemTable>,
    imm: Option<Arc<MemTable>>,
    log: Option<wal::Writer>,
    log_file_number: u64,
    writers: VecDeque<Arc<WriteTicket>>,
    snapshots: SnapshotList,
    /// Table files being written; protected from the obsolete sweep.
    pending_outputs: HashSet<u64>,
    bg_compaction_scheduled: bool,
    manual_compaction: Option<ManualCompaction>,
    bg_error: Option<Error>,
    stats: [CompactionStats; NUM_LEVELS],
}

pub(crate) struct DbInner {
    dbname: PathBuf,
    env: Arc<dyn Env>,
    options: Options,
    /// Options used for table files: internal comparator and filter.
    table_options: Options,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,

    state: Mutex<DbState>,
    /// Signalled when a round of background work completes.
    bg_work_done: Condvar,
    /// Signalled to wake the background thread.
    bg_work_available: Condvar,
    /// Signalled when the writer queue head changes.
    writers_cv: Condvar,

    /// The manifest writer lives outside the state mutex so appends can
    /// run with it released.
    manifest: Mutex<Option<wal::Writer>>,

    has_imm: AtomicBool,
    shutting_down: AtomicBool,
    db_lock: Mutex<Option<FileLock>>,
    seed: AtomicU32,
}

/// An embedded, ordered, persistent key-value store.
pub struct Db {
    inner: Arc<DbInner>,
    bg_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

fn clip<T: Ord>(value: T, lo: T, hi: T) -> T {
    value.max(lo).min(hi)
}

fn sanitize_options(mut options: Options) -> Options {
    options.write_buffer_size = clip(options.write_buffer_size, 64 << 10, 1 << 30);
    options.max_open_files = clip(options.max_open_files, 64 + NUM_NON_TABLE_CACHE_FILES, 50_000);
    options.block_size = clip(options.block_size, 1 << 10, 4 << 20);
    if options.block_cache.is_none() {
        options.block_cache = Some(Arc::new(BlockCache::new(8 << 20)));
    }
    options
}

fn table_options_for(options: &Options, icmp: &InternalKeyComparator) -> Options {
    let mut table_options = options.clone();
    table_options.comparator = Arc::new(icmp.clone());
    table_options.filter_policy = options.filter_policy.as_ref().map(|p| {
        let wrapped: Arc<dyn crate::util::bloom::FilterPolicy> =
            Arc::new(InternalFilterPolicy::new(p.clone()));
        wrapped
    });
    table_options
}

impl Db {
    /// Opens (optionally creating) the database at `dbname`.
    pub fn open(options: Options, dbname: impl AsRef<Path>) -> Result<Db> {
        let dbname = dbname.as_ref().to_path_buf();
        let options = sanitize_options(options);
        let icmp = InternalKeyComparator::new(options.comparator.clone());
        let table_options = table_options_for(&options, &icmp);
        let env = options.env.clone();

        let table_cache = Arc::new(TableCache::new(
            dbname.clone(),
            table_options.clone(),
            options.max_open_files - NUM_NON_TABLE_CACHE_FILES,
        ));

        let inner = Arc::new(DbInner {
            state: Mutex::new(DbState {
                versions: VersionSet::new(
                    dbname.clone(),
                    options.clone(),
                    icmp.clone(),
                    Arc::clone(&table_cache),
                ),
                mem: Arc::new(MemTable::new(icmp.clone())),
                imm: None,
                log: None,
                log_file_number: 0,
                writers: VecDeque::new(),
                snapshots: SnapshotList::new(),
                pending_outputs: HashSet::new(),
                bg_compaction_scheduled: false,
                manual_compaction: None,
                bg_error: None,
                stats: [CompactionStats::default(); NUM_LEVELS],
            }),
            bg_work_done: Condvar::new(),
            bg_work_available: Condvar::new(),
            writers_cv: Condvar::new(),
            manifest: Mutex::new(None),
            has_imm: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            db_lock: Mutex::new(None),
            seed: AtomicU32::new(0),
            dbname,
            env,
            options,
            table_options,
            icmp,
            table_cache,
        });

        {
            let guard = inner.state.lock().unwrap();
            let guard = inner.open_impl(guard)?;
            drop(guard);
        }

        let bg_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("cinderdb-bg".to_string())
            .spawn(move || background_thread_main(bg_inner))
            .map_err(|e| Error::io(format!("spawn background thread: {e}")))?;

        Ok(Db {
            inner,
            bg_thread: Mutex::new(Some(handle)),
        })
    }

    pub fn put(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(options, batch)
    }

    pub fn delete(&self, options: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(options, batch)
    }

    pub fn write(&self, options: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.inner.write(options, Some(batch))
    }

    pub fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(options, key)
    }

    /// An iterator over the whole database as of now (or of
    /// `options.snapshot`).
    pub fn iter(&self, options: &ReadOptions) -> DbIter {
        self.inner.new_iterator(options)
    }

    /// Pins the current sequence; reads through the handle see exactly
    /// the writes committed before this call. Dropping it releases the
    /// snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        let mut guard = self.inner.state.lock().unwrap();
        let seq = guard.versions.last_sequence();
        guard.snapshots.new_snapshot(seq)
    }

    /// Compacts the key range `[begin, end]` (None = unbounded) all the
    /// way down, including a memtable flush.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.inner.compact_range(begin, end)
    }

    /// Reads a named introspection property (prefix `cinderdb.`).
    pub fn property(&self, name: &str) -> Option<String> {
        self.inner.property(name)
    }

    /// Approximate on-disk bytes used by each `[start, limit)` range.
    pub fn approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64> {
        self.inner.approximate_sizes(ranges)
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.inner.shutting_down.store(true, MemOrder::Release);
        {
            let _guard = self.inner.state.lock().unwrap();
            self.inner.bg_work_available.notify_all();
        }
        if let Some(handle) = self.bg_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        // The final log buffer is already on disk (every append flushes);
        // just release the lock.
        *self.inner.db_lock.lock().unwrap() = None;
    }
}

impl DbInner {
    // ----------------------------------------------------------------
    // Open and recovery
    // ----------------------------------------------------------------

    fn open_impl<'a>(&'a self, mut guard: Guard<'a>) -> Result<Guard<'a>> {
        let _ = self.env.create_dir(&self.dbname);
        let lock = self.env.lock_file(&lock_file_name(&self.dbname))?;
        *self.db_lock.lock().unwrap() = Some(lock);

        let mut edit = VersionEdit::new();
        let (returned, save_manifest) = self.recover(guard, &mut edit)?;
        guard = returned;

        if guard.log.is_none() {
            // No reusable tail log: start a fresh one.
            let new_log_number = guard.versions.new_file_number();
            let file = self
                .env
                .new_writable_file(&log_file_name(&self.dbname, new_log_number))?;
            guard.log = Some(wal::Writer::new(file));
            guard.log_file_number = new_log_number;
        }

        if save_manifest {
            edit.set_prev_log_number(0);
            edit.set_log_number(guard.log_file_number);
            let (returned, status) = self.log_and_apply(guard, &mut edit);
            guard = returned;
            status?;
        }

        guard = self.remove_obsolete_files(guard);
        self.maybe_schedule_compaction(&mut guard);
        Ok(guard)
    }

    fn recover<'a>(
        &'a self,
        mut guard: Guard<'a>,
        edit: &mut VersionEdit,
    ) -> Result<(Guard<'a>, bool)> {
        if !self.env.file_exists(&current_file_name(&self.dbname)) {
            if !self.options.create_if_missing {
                return Err(Error::invalid_argument(format!(
                    "{}: does not exist (create_if_missing is false)",
                    self.dbname.display()
                )));
            }
            tracing::info!(db = %self.dbname.display(), "creating new database");
            self.new_db()?;
        } else if self.options.error_if_exists {
            return Err(Error::invalid_argument(format!(
                "{}: exists (error_if_exists is true)",
                self.dbname.display()
            )));
        }

        let outcome = guard.versions.recover()?;
        if let Some(writer) = outcome.manifest_writer {
            *self.manifest.lock().unwrap() = Some(writer);
        }
        let mut save_manifest = outcome.save_manifest;

        // Every file a live version references must exist; a missing
        // table means the directory was damaged.
        let mut expected: HashSet<u64> = HashSet::new();
        guard.versions.add_live_files(&mut expected);
        let min_log = guard.versions.log_number();
        let prev_log = guard.versions.prev_log_number();
        let mut logs = Vec::new();
        for name in self.env.children(&self.dbname)? {
            if let Some((number, file_type)) = parse_file_name(&name) {
                expected.remove(&number);
                if file_type == FileType::Log && (number >= min_log || number == prev_log) {
                    logs.push(number);
                }
            }
        }
        if !expected.is_empty() {
            let example = expected.iter().next().copied().unwrap_or(0);
            return Err(Error::corruption(format!(
                "{} missing table files; e.g. {}",
                expected.len(),
                table_file_name(&self.dbname, example).display()
            )));
        }

        // Replay logs in order; newer logs may contain fresher data for
        // the same keys.
        logs.sort_unstable();
        let mut max_sequence = 0;
        for (i, &log_number) in logs.iter().enumerate() {
            let last_log = i + 1 == logs.len();
            let (returned, status) = self.recover_log_file(
                guard,
                log_number,
                last_log,
                &mut save_manifest,
                edit,
                &mut max_sequence,
            );
            guard = returned;
            status?;
            // The log's number is in use even though no manifest record
            // mentions it yet.
            guard.versions.mark_file_number_used(log_number);
        }

        if guard.versions.last_sequence() < max_sequence {
            guard.versions.set_last_sequence(max_sequence);
        }
        Ok((guard, save_manifest))
    }

    fn new_db(&self) -> Result<()> {
        let mut new_db = VersionEdit::new();
        new_db.set_comparator_name(self.options.comparator.name());
        new_db.set_log_number(0);
        new_db.set_next_file_number(2);
        new_db.set_last_sequence(0);

        let manifest = descriptor_file_name(&self.dbname, 1);
        let file = self.env.new_writable_file(&manifest)?;
        let mut log = wal::Writer::new(file);
        let mut record = Vec::new();
        new_db.encode_to(&mut record);
        let result = log
            .add_record(&record)
            .and_then(|_| log.sync())
            .and_then(|_| set_current_file(self.env.as_ref(), &self.dbname, 1));
        if result.is_err() {
            let _ = self.env.remove_file(&manifest);
        }
        result
    }

    fn maybe_ignore_error(&self, status: Result<()>, context: &str) -> Result<()> {
        match status {
            Ok(()) => Ok(()),
            Err(e) if self.options.paranoid_checks => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, context, "ignoring recovery error");
                Ok(())
            }
        }
    }

    fn recover_log_file<'a>(
        &'a self,
        mut guard: Guard<'a>,
        log_number: u64,
        last_log: bool,
        save_manifest: &mut bool,
        edit: &mut VersionEdit,
        max_sequence: &mut SequenceNumber,
    ) -> (Guard<'a>, Result<()>) {
        struct LogReporter {
            log_number: u64,
            paranoid: bool,
            error: Arc<Mutex<Option<Error>>>,
        }
        impl wal::Reporter for LogReporter {
            fn corruption(&mut self, bytes: usize, reason: &str) {
                tracing::warn!(
                    log = self.log_number,
                    dropped_bytes = bytes,
                    reason,
                    "log record dropped"
                );
                if self.paranoid {
                    let mut slot = self.error.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(Error::corruption(format!(
                            "log {}: {reason}",
                            self.log_number
                        )));
                    }
                }
            }
        }

        let fname = log_file_name(&self.dbname, log_number);
        let file = match self.env.new_sequential_file(&fname) {
            Ok(file) => file,
            Err(e) => {
                let status = self.maybe_ignore_error(Err(e), "opening log file");
                return (guard, status);
            }
        };

        let reporter_error = Arc::new(Mutex::new(None));
        let mut reader = wal::Reader::new(
            file,
            Some(Box::new(LogReporter {
                log_number,
                paranoid: self.options.paranoid_checks,
                error: Arc::clone(&reporter_error),
            })),
            true,
            0,
        );
        tracing::info!(log = log_number, "recovering log file");

        let mut mem: Option<Arc<MemTable>> = None;
        let mut batch = WriteBatch::new();
        let mut compactions = 0;

        while let Some(record) = reader.read_record() {
            if reporter_error.lock().unwrap().is_some() {
                break;
            }
            if record.len() < crate::batch::BATCH_HEADER_SIZE {
                tracing::warn!(
                    log = log_number,
                    bytes = record.len(),
                    "log record too small"
                );
                continue;
            }
            if let Err(e) = batch.set_contents(&record) {
                let status = self.maybe_ignore_error(Err(e), "decoding log record");
                if status.is_err() {
                    return (guard, status);
                }
                continue;
            }

            let mem_ref = mem
                .get_or_insert_with(|| Arc::new(MemTable::new(self.icmp.clone())));
            if let Err(e) = batch.insert_into(mem_ref) {
                let status = self.maybe_ignore_error(Err(e), "applying log record");
                if status.is_err() {
                    return (guard, status);
                }
                continue;
            }

            let last_seq = batch.sequence() + batch.count() as u64 - 1;
            if last_seq > *max_sequence {
                *max_sequence = last_seq;
            }

            if mem_ref.approximate_memory_usage() > self.options.write_buffer_size {
                compactions += 1;
                *save_manifest = true;
                let full = mem.take().unwrap();
                let (returned, status) = self.write_level0_table(guard, full, edit, None);
                guard = returned;
                if status.is_err() {
                    return (guard, status);
                }
            }
        }

        if let Some(e) = reporter_error.lock().unwrap().take() {
            return (guard, Err(e));
        }

        // With nothing flushed from it, the tail log can simply keep
        // growing across the restart.
        if self.options.reuse_logs && last_log && compactions == 0 {
            if let (Ok(size), Ok(file)) = (
                self.env.file_size(&fname),
                self.env.new_appendable_file(&fname),
            ) {
                tracing::info!(log = log_number, bytes = size, "reusing old log");
                guard.log = Some(wal::Writer::with_dest_length(file, size));
                guard.log_file_number = log_number;
                if let Some(m) = mem.take() {
                    guard.mem = m;
                }
            }
        }

        if let Some(m) = mem.take() {
            *save_manifest = true;
            let (returned, status) = self.write_level0_table(guard, m, edit, None);
            guard = returned;
            if status.is_err() {
                return (guard, status);
            }
        }

        (guard, Ok(()))
    }

    // ----------------------------------------------------------------
    // Flushing
    // ----------------------------------------------------------------

    fn write_level0_table<'a>(
        &'a self,
        mut guard: Guard<'a>,
        mem: Arc<MemTable>,
        edit: &mut VersionEdit,
        base: Option<Arc<Version>>,
    ) -> (Guard<'a>, Result<()>) {
        let start = Instant::now();
        let number = guard.versions.new_file_number();
        guard.pending_outputs.insert(number);
        tracing::info!(file = number, "level-0 table started");

        let iter = mem.iter();
        drop(guard);
        let built = build_table(
            &self.dbname,
            self.env.as_ref(),
            &self.table_options,
            &self.table_cache,
            Box::new(iter),
            number,
        );
        let mut guard = self.state.lock().unwrap();
        guard.pending_outputs.remove(&number);

        match built {
            Err(e) => {
                tracing::error!(file = number, error = %e, "level-0 table failed");
                (guard, Err(e))
            }
            Ok(None) => {
                guard.versions.reuse_file_number(number);
                (guard, Ok(()))
            }
            Ok(Some((file_size, smallest, largest))) => {
                // Push small flushes past level 0 when they overlap
                // nothing there.
                let level = match &base {
                    Some(base) => base.pick_level_for_memtable_output(
                        &self.options,
                        smallest.user_key(),
                        largest.user_key(),
                    ),
                    None => 0,
                };
                tracing::info!(
                    file = number,
                    level,
                    bytes = file_size,
                    "level-0 table finished"
                );
                edit.add_file(level, number, file_size, smallest, largest);
                guard.stats[level].micros += start.elapsed().as_micros() as u64;
                guard.stats[level].bytes_written += file_size;
                (guard, Ok(()))
            }
        }
    }

    fn compact_memtable<'a>(&'a self, mut guard: Guard<'a>) -> Guard<'a> {
        let imm = match &guard.imm {
            Some(imm) => Arc::clone(imm),
            None => return guard,
        };

        let mut edit = VersionEdit::new();
        let base = guard.versions.current();
        let (returned, mut status) =
            self.write_level0_table(guard, imm, &mut edit, Some(base));
        guard = returned;

        if status.is_ok() && self.shutting_down.load(MemOrder::Acquire) {
            status = Err(Error::io("deleting DB during memtable compaction"));
        }

        if status.is_ok() {
            edit.set_prev_log_number(0);
            // Earlier logs are no longer needed.
            edit.set_log_number(guard.log_file_number);
            let (returned, s) = self.log_and_apply(guard, &mut edit);
            guard = returned;
            status = s;
        }

        if status.is_ok() {
            guard.imm = None;
            self.has_imm.store(false, MemOrder::Release);
            guard = self.remove_obsolete_files(guard);
        } else {
            self.record_background_error(&mut guard, status.unwrap_err());
        }
        guard
    }

    // ----------------------------------------------------------------
    // Manifest
    // ----------------------------------------------------------------

    /// Builds the next version for `edit`, appends to the manifest with
    /// the state mutex released, and installs on success.
    fn log_and_apply<'a>(
        &'a self,
        mut guard: Guard<'a>,
        edit: &mut VersionEdit,
    ) -> (Guard<'a>, Result<()>) {
        let write = guard.versions.prepare_log_and_apply(edit);
        let manifest_number = write.manifest_number;
        drop(guard);

        let mut io_result: Result<()> = Ok(());
        {
            let mut manifest_guard = self.manifest.lock().unwrap();
            if write.create_manifest {
                let path = descriptor_file_name(&self.dbname, manifest_number);
                match self.env.new_writable_file(&path) {
                    Ok(file) => {
                        let mut writer = wal::Writer::new(file);
                        if let Some(snapshot) = &write.snapshot_record {
                            io_result = writer.add_record(snapshot);
                        }
                        if io_result.is_ok() {
                            *manifest_guard = Some(writer);
                        }
                    }
                    Err(e) => io_result = Err(e),
                }
            }

            if io_result.is_ok() {
                match manifest_guard.as_mut() {
                    Some(writer) => {
                        io_result = writer
                            .add_record(&write.edit_record)
                            .and_then(|_| writer.sync());
                    }
                    None => io_result = Err(Error::io("manifest is not open")),
                }
            }

            if io_result.is_ok() && write.create_manifest {
                io_result = set_current_file(self.env.as_ref(), &self.dbname, manifest_number);
            }

            if io_result.is_err() {
                tracing::error!(
                    manifest = manifest_number,
                    error = %io_result.as_ref().unwrap_err().to_string(),
                    "manifest write failed"
                );
                if write.create_manifest {
                    *manifest_guard = None;
                    let _ = self
                        .env
                        .remove_file(&descriptor_file_name(&self.dbname, manifest_number));
                }
            }
        }

        let mut guard = self.state.lock().unwrap();
        let ok = io_result.is_ok();
        guard.versions.install_log_and_apply(write, ok);
        (guard, io_result)
    }

    // ----------------------------------------------------------------
    // Write path
    // ----------------------------------------------------------------

    fn write(&self, options: &WriteOptions, batch: Option<WriteBatch>) -> Result<()> {
        let force = batch.is_none();
        let ticket = Arc::new(WriteTicket {
            batch,
            sync: options.sync,
            done: Mutex::new(None),
        });

        let mut guard = self.state.lock().unwrap();
        guard.writers.push_back(Arc::clone(&ticket));
        loop {
            if let Some(result) = ticket.done.lock().unwrap().clone() {
                return result;
            }
            let is_head = guard
                .writers
                .front()
                .map(|front| Arc::ptr_eq(front, &ticket))
                .unwrap_or(false);
            if is_head {
                break;
            }
            guard = self.writers_cv.wait(guard).unwrap();
        }

        // Leader: reserve space, then commit a group in one append.
        let (returned, mut status) = self.make_room_for_write(guard, force);
        guard = returned;

        let mut last_writer = 0;
        if status.is_ok() && !force {
            let (mut group, last, sync) = build_batch_group(&guard);
            let mut last_sequence = guard.versions.last_sequence();
            group.set_sequence(last_sequence + 1);
            last_sequence += group.count() as u64;
            last_writer = last;

            // Leader exclusivity makes the log and memtable safe to
            // touch with the mutex released.
            let mut log = guard.log.take();
            let mem = Arc::clone(&guard.mem);
            drop(guard);

            let mut sync_error = false;
            if let Some(log) = log.as_mut() {
                status = log.add_record(group.contents());
                if status.is_ok() && sync {
                    status = log.sync();
                    if status.is_err() {
                        sync_error = true;
                    }
                }
            }
            if status.is_ok() {
                status = group.insert_into(&mem);
            }

            guard = self.state.lock().unwrap();
            guard.log = log;
            if sync_error {
                // The log tail is in an unknown state; no further writes
                // may touch it.
                self.record_background_error(&mut guard, status.clone().unwrap_err());
            }
            guard.versions.set_last_sequence(last_sequence);
        }

        for _ in 0..=last_writer {
            let done = guard
                .writers
                .pop_front()
                .expect("writer queue shorter than group");
            *done.done.lock().unwrap() = Some(status.clone());
        }
        self.writers_cv.notify_all();
        drop(guard);
        status
    }

    /// Blocks until the memtable has room (possibly rotating it),
    /// applying the level-0 back-pressure rules.
    fn make_room_for_write<'a>(
        &'a self,
        mut guard: Guard<'a>,
        mut force: bool,
    ) -> (Guard<'a>, Result<()>) {
        let mut allow_delay = !force;
        loop {
            if let Some(e) = &guard.bg_error {
                let err = e.clone();
                return (guard, Err(err));
            }

            if allow_delay
                && guard.versions.num_level_files(0) >= L0_SLOWDOWN_WRITES_TRIGGER
            {
                // Hand the CPU to the compactor for a moment instead of
                // stalling a write for seconds once L0 fills up. At most
                // one delay per write.
                drop(guard);
                std::thread::sleep(Duration::from_millis(1));
                allow_delay = false;
                guard = self.state.lock().unwrap();
                continue;
            }

            if !force
                && guard.mem.approximate_memory_usage() <= self.options.write_buffer_size
            {
                return (guard, Ok(()));
            }

            if guard.imm.is_some() {
                tracing::debug!("current memtable full; waiting on flush");
                guard = self.bg_work_done.wait(guard).unwrap();
                continue;
            }

            if guard.versions.num_level_files(0) >= L0_STOP_WRITES_TRIGGER {
                tracing::debug!("too many level-0 files; waiting on compaction");
                guard = self.bg_work_done.wait(guard).unwrap();
                continue;
            }

            // Rotate: fresh log + memtable, previous one becomes
            // immutable and is handed to the background thread.
            let new_log_number = guard.versions.new_file_number();
            let file = match self
                .env
                .new_writable_file(&log_file_name(&self.dbname, new_log_number))
            {
                Ok(file) => file,
                Err(e) => {
                    guard.versions.reuse_file_number(new_log_number);
                    return (guard, Err(e));
                }
            };
            guard.log = Some(wal::Writer::new(file));
            guard.log_file_number = new_log_number;
            let full = std::mem::replace(
                &mut guard.mem,
                Arc::new(MemTable::new(self.icmp.clone())),
            );
            guard.imm = Some(full);
            self.has_imm.store(true, MemOrder::Release);
            force = false;
            self.maybe_schedule_compaction(&mut guard);
        }
    }

    // ----------------------------------------------------------------
    // Read path
    // ----------------------------------------------------------------

    fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let guard = self.state.lock().unwrap();
        let sequence = match &options.snapshot {
            Some(snapshot) => snapshot.sequence(),
            None => guard.versions.last_sequence(),
        };
        let mem = Arc::clone(&guard.mem);
        let imm = guard.imm.clone();
        let current = guard.versions.current();
        drop(guard);

        let lookup = LookupKey::new(key, sequence);
        let mut stats = None;
        let result = if let Some(found) = mem.get(&lookup) {
            Ok(found)
        } else if let Some(found) = imm.as_ref().and_then(|imm| imm.get(&lookup)) {
            Ok(found)
        } else {
            let (result, get_stats) = current.get(options, &lookup, &self.table_cache);
            stats = Some(get_stats);
            result
        };

        if let Some(stats) = stats {
            let mut guard = self.state.lock().unwrap();
            if current.update_stats(stats) {
                self.maybe_schedule_compaction(&mut guard);
            }
        }
        result
    }

    fn new_iterator(self: &Arc<Self>, options: &ReadOptions) -> DbIter {
        let mut guard = self.state.lock().unwrap();
        let sequence = match &options.snapshot {
            Some(snapshot) => snapshot.sequence(),
            None => guard.versions.last_sequence(),
        };

        let mut children: Vec<Box<dyn Iter>> = vec![Box::new(guard.mem.iter())];
        if let Some(imm) = &guard.imm {
            children.push(Box::new(imm.iter()));
        }
        let current = guard.versions.current();
        current.add_iterators(options, &self.table_cache, &mut children);
        drop(guard);

        let cmp: Arc<dyn Comparator> = Arc::new(self.icmp.clone());
        let merged = MergingIter::new(cmp, children);
        let seed = self.seed.fetch_add(1, MemOrder::Relaxed).wrapping_add(1);
        DbIter::new(
            Arc::clone(self),
            self.options.comparator.clone(),
            Box::new(merged),
            sequence,
            seed,
            current,
        )
    }

    pub(crate) fn record_read_sample(&self, internal_key: &[u8]) {
        let mut guard = self.state.lock().unwrap();
        if guard.versions.current().record_read_sample(internal_key) {
            self.maybe_schedule_compaction(&mut guard);
        }
    }

    // ----------------------------------------------------------------
    // Background work
    // ----------------------------------------------------------------

    fn record_background_error(&self, guard: &mut DbState, e: Error) {
        if guard.bg_error.is_none() {
            tracing::error!(error = %e, "background error; all further writes will fail");
            guard.bg_error = Some(e);
        }
        self.bg_work_done.notify_all();
    }

    fn maybe_schedule_compaction(&self, guard: &mut DbState) {
        if guard.bg_compaction_scheduled {
            return;
        }
        if self.shutting_down.load(MemOrder::Acquire) || guard.bg_error.is_some() {
            return;
        }
        let manual_pending = guard
            .manual_compaction
            .as_ref()
            .is_some_and(|m| !m.done);
        if guard.imm.is_none() && !manual_pending && !guard.versions.needs_compaction() {
            return;
        }
        guard.bg_compaction_scheduled = true;
        self.bg_work_available.notify_one();
    }

    fn background_compaction<'a>(&'a self, mut guard: Guard<'a>) -> Guard<'a> {
        if guard.imm.is_some() {
            return self.compact_memtable(guard);
        }

        let is_manual = guard
            .manual_compaction
            .as_ref()
            .is_some_and(|m| !m.done);
        let mut manual_end: Option<InternalKey> = None;

        let compaction = if is_manual {
            let mut manual = guard.manual_compaction.take().unwrap();
            let compaction = guard.versions.compact_range(
                manual.level,
                manual.begin.as_ref(),
                manual.end.as_ref(),
            );
            manual.done = compaction.is_none();
            if let Some(c) = &compaction {
                manual_end = Some(
                    c.input(0, c.num_input_files(0) - 1).largest.clone(),
                );
            }
            tracing::info!(
                level = manual.level,
                done = manual.done,
                "manual compaction round"
            );
            guard.manual_compaction = Some(manual);
            compaction
        } else {
            guard.versions.pick_compaction()
        };

        let mut status = Ok(());
        match compaction {
            None => {}
            Some(mut c) if !is_manual && c.is_trivial_move() => {
                // No merging needed; just move the file down a level.
                let f = Arc::clone(c.input(0, 0));
                c.edit.remove_file(c.level(), f.number);
                c.edit.add_file(
                    c.level() + 1,
                    f.number,
                    f.file_size,
                    f.smallest.clone(),
                    f.largest.clone(),
                );
                let level = c.level();
                let mut edit = std::mem::take(&mut c.edit);
                let (returned, s) = self.log_and_apply(guard, &mut edit);
                guard = returned;
                status = s;
                tracing::info!(
                    file = f.number,
                    from_level = level,
                    to_level = level + 1,
                    bytes = f.file_size,
                    ok = status.is_ok(),
                    "trivial move"
                );
            }
            Some(c) => {
                let smallest_snapshot = guard
                    .snapshots
                    .oldest()
                    .unwrap_or_else(|| guard.versions.last_sequence());
                let mut compact = CompactionState::new(c, smallest_snapshot);
                let (returned, s) = self.do_compaction_work(guard, &mut compact);
                guard = returned;
                status = s;
                self.cleanup_compaction(&mut guard, &mut compact);
                compact.compaction.release_inputs();
                guard = self.remove_obsolete_files(guard);
            }
        }

        match &status {
            Ok(()) => {}
            Err(e) if self.shutting_down.load(MemOrder::Acquire) => {
                tracing::debug!(error = %e, "compaction error during shutdown");
            }
            Err(e) => {
                self.record_background_error(&mut guard, e.clone());
            }
        }

        if is_manual {
            if let Some(manual) = guard.manual_compaction.as_mut() {
                if status.is_err() {
                    manual.done = true;
                }
                if !manual.done {
                    // Only part of the range was compacted; resume after
                    // the last key this round covered.
                    manual.begin = manual_end;
                }
            }
        }
        guard
    }

    fn open_compaction_output_file(&self, compact: &mut CompactionState) -> Result<()> {
        debug_assert!(compact.builder.is_none());
        let number = {
            let mut guard = self.state.lock().unwrap();
            let number = guard.versions.new_file_number();
            guard.pending_outputs.insert(number);
            number
        };
        compact.outputs.push(CompactionOutput {
            number,
            file_size: 0,
            smallest: InternalKey::default(),
            largest: InternalKey::default(),
        });

        let fname = table_file_name(&self.dbname, number);
        let file = self.env.new_writable_file(&fname)?;
        compact.builder = Some(TableBuilder::new(self.table_options.clone(), file));
        Ok(())
    }

    fn finish_compaction_output_file(
        &self,
        compact: &mut CompactionState,
        input_ok: Result<()>,
    ) -> Result<()> {
        let mut builder = compact.builder.take().expect("no open output");
        let output_number = compact.current_output().number;
        debug_assert!(output_number != 0);

        let current_entries = builder.num_entries();
        let mut status = input_ok;
        if status.is_ok() {
            status = builder.finish();
        } else {
            builder.abandon();
        }
        let current_bytes = builder.file_size();
        compact.current_output().file_size = current_bytes;
        compact.total_bytes += current_bytes;
        if status.is_ok() {
            status = builder.sync();
        }
        drop(builder);

        if status.is_ok() && current_entries > 0 {
            // Verify the table is usable before we commit to it.
            let it = self.table_cache.new_iterator(
                &ReadOptions::new(),
                output_number,
                current_bytes,
            );
            status = it.status();
            if status.is_ok() {
                tracing::info!(
                    file = output_number,
                    entries = current_entries,
                    bytes = current_bytes,
                    "generated compaction output"
                );
            }
        }
        status
    }

    fn do_compaction_work<'a>(
        &'a self,
        guard: Guard<'a>,
        compact: &mut CompactionState,
    ) -> (Guard<'a>, Result<()>) {
        let start = Instant::now();
        let mut imm_micros = Duration::ZERO;
        let level = compact.compaction.level();

        tracing::info!(
            level,
            files = compact.compaction.num_input_files(0),
            next_level_files = compact.compaction.num_input_files(1),
            "compacting"
        );
        debug_assert!(compact.builder.is_none());
        debug_assert!(compact.outputs.is_empty());

        let mut input = guard.versions.make_input_iterator(&compact.compaction);
        drop(guard);

        input.seek_to_first();
        let ucmp = self.icmp.user_comparator().clone();
        let mut status: Result<()> = Ok(());
        let mut current_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = MAX_SEQUENCE_NUMBER;

        while input.valid() && !self.shutting_down.load(MemOrder::Acquire) {
            // The immutable memtable outranks compaction work.
            if self.has_imm.load(MemOrder::Acquire) {
                let imm_start = Instant::now();
                let mut guard = self.state.lock().unwrap();
                if guard.imm.is_some() {
                    guard = self.compact_memtable(guard);
                    self.bg_work_done.notify_all();
                }
                drop(guard);
                imm_micros += imm_start.elapsed();
            }

            let key = input.key().to_vec();
            if compact.compaction.should_stop_before(&key) && compact.builder.is_some() {
                status = self.finish_compaction_output_file(compact, input.status());
                if status.is_err() {
                    break;
                }
            }

            let mut drop_entry = false;
            match crate::keys::parse_internal_key(&key) {
                None => {
                    // Keep corrupted keys; dropping them would hide the
                    // damage from the user.
                    current_user_key = None;
                    last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                }
                Some(ikey) => {
                    let first_occurrence = current_user_key
                        .as_deref()
                        .map_or(true, |cur| {
                            ucmp.compare(ikey.user_key, cur) != std::cmp::Ordering::Equal
                        });
                    if first_occurrence {
                        current_user_key = Some(ikey.user_key.to_vec());
                        last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                    }

                    if last_sequence_for_key <= compact.smallest_snapshot {
                        // Shadowed by a newer entry that every live
                        // snapshot already sees.
                        drop_entry = true;
                    } else if ikey.value_type == ValueType::Deletion
                        && ikey.sequence <= compact.smallest_snapshot
                        && compact.compaction.is_base_level_for_key(ikey.user_key)
                    {
                        // The tombstone has nothing left to delete below
                        // this output level.
                        drop_entry = true;
                    }

                    last_sequence_for_key = ikey.sequence;
                }
            }

            if !drop_entry {
                if compact.builder.is_none() {
                    status = self.open_compaction_output_file(compact);
                    if status.is_err() {
                        break;
                    }
                }
                let builder = compact.builder.as_mut().unwrap();
                if builder.num_entries() == 0 {
                    compact.current_output().smallest =
                        InternalKey::decode_from(&key).unwrap_or_default();
                }
                compact.current_output().largest =
                    InternalKey::decode_from(&key).unwrap_or_default();
                let builder = compact.builder.as_mut().unwrap();
                builder.add(&key, input.value());

                if builder.file_size() >= compact.compaction.max_output_file_size() {
                    status = self.finish_compaction_output_file(compact, input.status());
                    if status.is_err() {
                        break;
                    }
                }
            }

            input.next();
        }

        if status.is_ok() && self.shutting_down.load(MemOrder::Acquire) {
            status = Err(Error::io("deleting DB during compaction"));
        }
        if status.is_ok() && compact.builder.is_some() {
            status = self.finish_compaction_output_file(compact, input.status());
        }
        if status.is_ok() {
            status = input.status();
        }
        drop(input);

        let mut guard = self.state.lock().unwrap();

        let mut stats = CompactionStats {
            micros: start.elapsed().saturating_sub(imm_micros).as_micros() as u64,
            bytes_read: 0,
            bytes_written: compact.total_bytes,
        };
        for which in 0..2 {
            for i in 0..compact.compaction.num_input_files(which) {
                stats.bytes_read += compact.compaction.input(which, i).file_size;
            }
        }
        guard.stats[level + 1].micros += stats.micros;
        guard.stats[level + 1].bytes_read += stats.bytes_read;
        guard.stats[level + 1].bytes_written += stats.bytes_written;

        if status.is_ok() {
            let (returned, s) = self.install_compaction_results(guard, compact);
            guard = returned;
            status = s;
        }
        tracing::info!(summary = %guard.versions.level_summary(), "compacted to");
        (guard, status)
    }

    fn install_compaction_results<'a>(
        &'a self,
        guard: Guard<'a>,
        compact: &mut CompactionState,
    ) -> (Guard<'a>, Result<()>) {
        let level = compact.compaction.level();
        tracing::info!(
            level,
            inputs = compact.compaction.num_input_files(0),
            next_level_inputs = compact.compaction.num_input_files(1),
            outputs = compact.outputs.len(),
            bytes = compact.total_bytes,
            "installing compaction results"
        );

        compact.compaction.add_input_deletions();
        for out in &compact.outputs {
            compact.compaction.edit.add_file(
                level + 1,
                out.number,
                out.file_size,
                out.smallest.clone(),
                out.largest.clone(),
            );
        }
        let mut edit = std::mem::take(&mut compact.compaction.edit);
        self.log_and_apply(guard, &mut edit)
    }

    fn cleanup_compaction(&self, guard: &mut DbState, compact: &mut CompactionState) {
        if let Some(mut builder) = compact.builder.take() {
            // The merge bailed out mid-file.
            builder.abandon();
        }
        for out in &compact.outputs {
            guard.pending_outputs.remove(&out.number);
        }
    }

    // ----------------------------------------------------------------
    // Manual compaction
    // ----------------------------------------------------------------

    fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let max_level_with_files = {
            let guard = self.state.lock().unwrap();
            let current = guard.versions.current();
            let mut max_level = 1;
            for level in 1..NUM_LEVELS {
                if current.overlap_in_level(level, begin, end) {
                    max_level = level;
                }
            }
            max_level
        };

        self.flush_memtable()?;
        for level in 0..max_level_with_files {
            self.compact_range_level(level, begin, end)?;
        }
        Ok(())
    }

    /// Forces the active memtable out and waits until it is flushed.
    fn flush_memtable(&self) -> Result<()> {
        self.write(&WriteOptions::default(), None)?;
        let mut guard = self.state.lock().unwrap();
        while guard.imm.is_some() && guard.bg_error.is_none() {
            guard = self.bg_work_done.wait(guard).unwrap();
        }
        match &guard.bg_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn compact_range_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        debug_assert!(level + 1 < NUM_LEVELS);

        let manual = ManualCompaction {
            level,
            done: false,
            begin: begin.map(|k| InternalKey::new(k, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK)),
            end: end.map(|k| InternalKey::new(k, 0, ValueType::Deletion)),
        };

        let mut guard = self.state.lock().unwrap();
        debug_assert!(guard.manual_compaction.is_none());
        guard.manual_compaction = Some(manual);
        self.maybe_schedule_compaction(&mut guard);
        loop {
            if self.shutting_down.load(MemOrder::Acquire) {
                guard.manual_compaction = None;
                return Ok(());
            }
            if let Some(e) = &guard.bg_error {
                let e = e.clone();
                guard.manual_compaction = None;
                return Err(e);
            }
            let done = guard
                .manual_compaction
                .as_ref()
                .map_or(true, |m| m.done);
            if done {
                guard.manual_compaction = None;
                return Ok(());
            }
            self.maybe_schedule_compaction(&mut guard);
            guard = self.bg_work_done.wait(guard).unwrap();
        }
    }

    // ----------------------------------------------------------------
    // Obsolete files
    // ----------------------------------------------------------------

    fn remove_obsolete_files<'a>(&'a self, mut guard: Guard<'a>) -> Guard<'a> {
        if guard.bg_error.is_some() {
            // A failed background write leaves the committed state
            // uncertain; keep everything for inspection.
            return guard;
        }

        let mut live = guard.pending_outputs.clone();
        guard.versions.add_live_files(&mut live);

        let children = match self.env.children(&self.dbname) {
            Ok(children) => children,
            Err(_) => return guard,
        };
        let log_number = guard.versions.log_number();
        let prev_log_number = guard.versions.prev_log_number();
        let manifest_number = guard.versions.manifest_file_number();

        let mut files_to_delete = Vec::new();
        for name in children {
            let Some((number, file_type)) = parse_file_name(&name) else {
                continue;
            };
            let keep = match file_type {
                FileType::Log => number >= log_number || number == prev_log_number,
                FileType::Descriptor => number >= manifest_number,
                FileType::Table => live.contains(&number),
                // In-progress outputs are protected while pending.
                FileType::Temp => live.contains(&number),
                FileType::Current | FileType::DbLock | FileType::InfoLog => true,
            };
            if !keep {
                if file_type == FileType::Table {
                    self.table_cache.evict(number);
                }
                tracing::info!(file = %name, number, "deleting obsolete file");
                files_to_delete.push(name);
            }
        }

        // The filenames are snapshotted; deletion can proceed without
        // the state lock.
        drop(guard);
        for name in files_to_delete {
            let _ = self.env.remove_file(&self.dbname.join(name));
        }
        self.state.lock().unwrap()
    }

    // ----------------------------------------------------------------
    // Introspection
    // ----------------------------------------------------------------

    fn property(&self, name: &str) -> Option<String> {
        let rest = name.strip_prefix("cinderdb.")?;

        if let Some(level) = rest.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            let guard = self.state.lock().unwrap();
            return Some(guard.versions.num_level_files(level).to_string());
        }

        match rest {
            "stats" => {
                let guard = self.state.lock().unwrap();
                let mut out = String::from(
                    "                               Compactions\n\
                     Level  Files Size(MB) Time(sec) Read(MB) Write(MB)\n\
                     --------------------------------------------------\n",
                );
                for level in 0..NUM_LEVELS {
                    let files = guard.versions.num_level_files(level);
                    let stats = guard.stats[level];
                    if stats.micros > 0 || files > 0 {
                        out.push_str(&format!(
                            "{:3} {:8} {:8.0} {:9.3} {:8.1} {:9.1}\n",
                            level,
                            files,
                            guard.versions.num_level_bytes(level) as f64 / 1048576.0,
                            stats.micros as f64 / 1e6,
                            stats.bytes_read as f64 / 1048576.0,
                            stats.bytes_written as f64 / 1048576.0,
                        ));
                    }
                }
                Some(out)
            }
            "sstables" => {
                let guard = self.state.lock().unwrap();
                let current = guard.versions.current();
                let mut out = String::new();
                for level in 0..NUM_LEVELS {
                    out.push_str(&format!("--- level {level} ---\n"));
                    for f in &current.files[level] {
                        out.push_str(&format!(
                            " {}:{}[{} .. {}]\n",
                            f.number,
                            f.file_size,
                            debug_key(&f.smallest),
                            debug_key(&f.largest),
                        ));
                    }
                }
                Some(out)
            }
            "approximate-memory-usage" => {
                let guard = self.state.lock().unwrap();
                let mut total = self
                    .options
                    .block_cache
                    .as_ref()
                    .map_or(0, |cache| cache.total_charge());
                total += guard.mem.approximate_memory_usage();
                if let Some(imm) = &guard.imm {
                    total += imm.approximate_memory_usage();
                }
                Some(total.to_string())
            }
            _ => None,
        }
    }

    fn approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64> {
        let guard = self.state.lock().unwrap();
        let current = guard.versions.current();
        ranges
            .iter()
            .map(|(start, limit)| {
                let k1 = InternalKey::new(start, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
                let k2 = InternalKey::new(limit, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
                let start_offset = guard.versions.approximate_offset_of(&current, &k1);
                let limit_offset = guard.versions.approximate_offset_of(&current, &k2);
                limit_offset.saturating_sub(start_offset)
            })
            .collect()
    }
}

fn debug_key(key: &InternalKey) -> String {
    match crate::keys::parse_internal_key(key.encoded()) {
        Some(parsed) => format!(
            "'{}' @ {} : {}",
            String::from_utf8_lossy(parsed.user_key),
            parsed.sequence,
            parsed.value_type as u8
        ),
        None => format!("(bad){:?}", key.encoded()),
    }
}

/// Combines the head of the writer queue with followers, respecting the
/// group size cap and the sync barrier. Returns the combined batch, the
/// index of the last grouped writer, and whether the append must sync.
fn build_batch_group(guard: &Guard<'_>) -> (WriteBatch, usize, bool) {
    let first = guard.writers.front().expect("empty writer queue");
    let first_batch = first.batch.as_ref().expect("leader has no batch");
    let mut size = first_batch.approximate_size();

    // Small writes get a small cap so a slow group does not penalize
    // their latency too much.
    let max_size = if size <= 128 << 10 {
        size + (128 << 10)
    } else {
        1 << 20
    };

    let mut group = first_batch.clone();
    let mut last_writer = 0;
    for (i, ticket) in guard.writers.iter().enumerate().skip(1) {
        if ticket.sync && !first.sync {
            // A sync write must not ride a non-sync append.
            break;
        }
        let Some(batch) = &ticket.batch else {
            break;
        };
        size += batch.approximate_size();
        if size > max_size {
            break;
        }
        group.append(batch);
        last_writer = i;
    }
    (group, last_writer, first.sync)
}

fn background_thread_main(inner: Arc<DbInner>) {
    let mut guard = inner.state.lock().unwrap();
    loop {
        while !guard.bg_compaction_scheduled && !inner.shutting_down.load(MemOrder::Acquire) {
            guard = inner.bg_work_available.wait(guard).unwrap();
        }
        if inner.shutting_down.load(MemOrder::Acquire) {
            break;
        }
        guard = inner.background_compaction(guard);
        guard.bg_compaction_scheduled = false;
        // The previous round may have uncovered more work.
        inner.maybe_schedule_compaction(&mut guard);
        inner.bg_work_done.notify_all();
    }
    inner.bg_work_done.notify_all();
}

/// Writes `iter`'s contents (already in internal-key order) into table
/// file `number`. Returns None when the iterator was empty; the file is
/// deleted on error or emptiness.
fn build_table(
    dbname: &Path,
    env: &dyn Env,
    table_options: &Options,
    table_cache: &TableCache,
    mut iter: Box<dyn Iter>,
    number: u64,
) -> Result<Option<(u64, InternalKey, InternalKey)>> {
    iter.seek_to_first();
    if !iter.valid() {
        iter.status()?;
        return Ok(None);
    }

    let fname = table_file_name(dbname, number);
    let file = env.new_writable_file(&fname)?;
    let mut builder = TableBuilder::new(table_options.clone(), file);

    let result = (|| {
        let smallest = InternalKey::decode_from(iter.key())?;
        let mut largest = InternalKey::default();
        while iter.valid() {
            largest = InternalKey::decode_from(iter.key())?;
            builder.add(iter.key(), iter.value());
            iter.next();
        }
        builder.finish()?;
        builder.sync()?;
        iter.status()?;

        // Confirm the freshly written table is readable before it is
        // recorded anywhere.
        let file_size = builder.file_size();
        let it = table_cache.new_iterator(&ReadOptions::new(), number, file_size);
        it.status()?;
        Ok::<_, Error>((file_size, smallest, largest))
    })();

    match result {
        Ok((file_size, smallest, largest)) if file_size > 0 => {
            Ok(Some((file_size, smallest, largest)))
        }
        Ok(_) => {
            let _ = env.remove_file(&fname);
            Ok(None)
        }
        Err(e) => {
            let _ = env.remove_file(&fname);
            Err(e)
        }
    }
}

/// Deletes every file of the database at `dbname`. The database must
/// not be open.
pub fn destroy_db(options: &Options, dbname: impl AsRef<Path>) -> Result<()> {
    let dbname = dbname.as_ref();
    let env = options.env.clone();
    let children = match env.children(dbname) {
        Ok(children) => children,
        // Missing directory counts as already destroyed.
        Err(_) => return Ok(()),
    };

    let lockname = lock_file_name(dbname);
    let lock = env.lock_file(&lockname)?;
    let mut result = Ok(());
    for name in children {
        let Some((_, file_type)) = parse_file_name(&name) else {
            continue;
        };
        if file_type == FileType::DbLock {
            continue;
        }
        if let Err(e) = env.remove_file(&dbname.join(&name)) {
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    drop(lock);
    let _ = env.remove_file(&lockname);
    let _ = env.remove_dir(dbname);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_db(dir: &TempDir) -> Db {
        let options = Options::new().create_if_missing(true);
        Db::open(options, dir.path()).expect("open failed")
    }

    #[test]
    fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let wopts = WriteOptions::default();
        let ropts = ReadOptions::new();

        db.put(&wopts, b"foo", b"v1").unwrap();
        assert_eq!(db.get(&ropts, b"foo").unwrap(), Some(b"v1".to_vec()));

        db.put(&wopts, b"foo", b"v2").unwrap();
        assert_eq!(db.get(&ropts, b"foo").unwrap(), Some(b"v2".to_vec()));

        db.delete(&wopts, b"foo").unwrap();
        assert_eq!(db.get(&ropts, b"foo").unwrap(), None);
        assert_eq!(db.get(&ropts, b"missing").unwrap(), None);
    }

    #[test]
    fn test_empty_key_and_value() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let wopts = WriteOptions::default();
        let ropts = ReadOptions::new();

        db.put(&wopts, b"", b"empty-key").unwrap();
        db.put(&wopts, b"empty-value", b"").unwrap();
        assert_eq!(db.get(&ropts, b"").unwrap(), Some(b"empty-key".to_vec()));
        assert_eq!(
            db.get(&ropts, b"empty-value").unwrap(),
            Some(b"".to_vec())
        );
    }

    #[test]
    fn test_open_missing_without_create_fails() {
        let dir = TempDir::new().unwrap();
        let result = Db::open(Options::new(), dir.path().join("nope"));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_error_if_exists() {
        let dir = TempDir::new().unwrap();
        drop(open_db(&dir));
        let result = Db::open(
            Options::new().create_if_missing(true).error_if_exists(true),
            dir.path(),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let _db = open_db(&dir);
        let result = Db::open(Options::new().create_if_missing(true), dir.path());
        assert!(matches!(result, Err(Error::LockHeld(_))));
    }

    #[test]
    fn test_memtable_rotation_under_small_buffer() {
        let dir = TempDir::new().unwrap();
        let options = Options::new()
            .create_if_missing(true)
            .write_buffer_size(64 << 10);
        let db = Db::open(options, dir.path()).expect("open failed");
        let wopts = WriteOptions::default();
        let ropts = ReadOptions::new();

        let value = vec![b'x'; 1000];
        for i in 0..500u32 {
            db.put(&wopts, format!("key{i:05}").as_bytes(), &value)
                .unwrap();
        }
        // Everything stays readable through the rotations and flushes.
        for i in 0..500u32 {
            assert_eq!(
                db.get(&ropts, format!("key{i:05}").as_bytes()).unwrap(),
                Some(value.clone()),
                "key{i:05}"
            );
        }
        // Something must have reached level 0 (or deeper).
        let files: usize = (0..NUM_LEVELS)
            .map(|l| {
                db.property(&format!("cinderdb.num-files-at-level{l}"))
                    .unwrap()
                    .parse::<usize>()
                    .unwrap()
            })
            .sum();
        assert!(files >= 1, "expected at least one table file");
    }

    #[test]
    fn test_properties_smoke() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.put(&WriteOptions::default(), b"k", b"v").unwrap();

        assert!(db.property("cinderdb.num-files-at-level0").is_some());
        assert!(db.property("cinderdb.num-files-at-level99").is_none());
        assert!(db.property("cinderdb.stats").is_some());
        assert!(db.property("cinderdb.sstables").is_some());
        let usage: usize = db
            .property("cinderdb.approximate-memory-usage")
            .unwrap()
            .parse()
            .unwrap();
        assert!(usage > 0);
        assert!(db.property("bogus").is_none());
    }

    #[test]
    fn test_destroy_db_removes_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("victim");
        {
            let db = Db::open(
                Options::new().create_if_missing(true),
                &path,
            )
            .unwrap();
            db.put(&WriteOptions::default(), b"k", b"v").unwrap();
        }
        destroy_db(&Options::new(), &path).expect("destroy failed");
        assert!(!path.exists());
    }
}
