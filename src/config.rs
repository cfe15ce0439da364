//! Database configuration.

use std::sync::Arc;

use crate::db::snapshot::Snapshot;
use crate::env::{DiskEnv, Env};
use crate::sstable::BlockCache;
use crate::util::bloom::FilterPolicy;
use crate::util::comparator::{BytewiseComparator, Comparator};

/// Per-block compression codec. Stored in each block trailer, so a
/// database written with one codec can be read with any configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Snappy,
    Zstd,
}

impl CompressionType {
    pub fn to_byte(self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Snappy => 1,
            CompressionType::Zstd => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Snappy),
            2 => Some(CompressionType::Zstd),
            _ => None,
        }
    }
}

/// Options controlling the behavior of a database.
#[derive(Clone)]
pub struct Options {
    /// Defines the key order. Must be the same across every open of a
    /// given database.
    pub comparator: Arc<dyn Comparator>,

    /// Create the database directory and initial manifest when missing.
    pub create_if_missing: bool,

    /// Fail the open when the database already exists.
    pub error_if_exists: bool,

    /// Aggressively check stored data and surface recovery corruption
    /// instead of dropping it.
    pub paranoid_checks: bool,

    /// Filesystem provider.
    pub env: Arc<dyn Env>,

    /// Bytes buffered in the memtable before it rotates (default: 4MB).
    pub write_buffer_size: usize,

    /// Cap on open table files (default: 1000). Ten slots are reserved
    /// for non-table uses.
    pub max_open_files: usize,

    /// Shared data-block cache. When unset, the open installs a private
    /// 8MB cache.
    pub block_cache: Option<Arc<BlockCache>>,

    /// Uncompressed size target per data block (default: 4KB).
    pub block_size: usize,

    /// Keys between restart points within a block (default: 16).
    pub block_restart_interval: usize,

    /// Bytes written to a table file before compaction rolls to a new
    /// output (default: 2MB).
    pub max_file_size: usize,

    /// Block compression codec (default: Snappy; blocks that do not
    /// shrink are stored raw).
    pub compression: CompressionType,

    /// Level passed to zstd when `compression == Zstd` (default: 1).
    pub zstd_compression_level: i32,

    /// Reopen the tail WAL and manifest for append instead of rewriting
    /// them on recovery (default: false).
    pub reuse_logs: bool,

    /// Per-table filter policy consulted before data-block reads.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            comparator: Arc::new(BytewiseComparator),
            create_if_missing: false,
            error_if_exists: false,
            paranoid_checks: false,
            env: DiskEnv::shared(),
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            block_cache: None,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            max_file_size: 2 * 1024 * 1024,
            compression: CompressionType::Snappy,
            zstd_compression_level: 1,
            reuse_logs: false,
            filter_policy: None,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_if_missing(mut self, yes: bool) -> Self {
        self.create_if_missing = yes;
        self
    }

    pub fn error_if_exists(mut self, yes: bool) -> Self {
        self.error_if_exists = yes;
        self
    }

    pub fn paranoid_checks(mut self, yes: bool) -> Self {
        self.paranoid_checks = yes;
        self
    }

    pub fn comparator(mut self, cmp: Arc<dyn Comparator>) -> Self {
        self.comparator = cmp;
        self
    }

    pub fn env(mut self, env: Arc<dyn Env>) -> Self {
        self.env = env;
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn max_open_files(mut self, n: usize) -> Self {
        self.max_open_files = n;
        self
    }

    pub fn block_cache(mut self, cache: Arc<BlockCache>) -> Self {
        self.block_cache = Some(cache);
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn block_restart_interval(mut self, n: usize) -> Self {
        self.block_restart_interval = n;
        self
    }

    pub fn max_file_size(mut self, size: usize) -> Self {
        self.max_file_size = size;
        self
    }

    pub fn compression(mut self, ctype: CompressionType) -> Self {
        self.compression = ctype;
        self
    }

    pub fn zstd_compression_level(mut self, level: i32) -> Self {
        self.zstd_compression_level = level;
        self
    }

    pub fn reuse_logs(mut self, yes: bool) -> Self {
        self.reuse_logs = yes;
        self
    }

    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(policy);
        self
    }
}

/// Options for read operations.
#[derive(Clone)]
pub struct ReadOptions {
    /// Verify checksums of every block read (default: false).
    pub verify_checksums: bool,

    /// Whether blocks read for this operation should populate the block
    /// cache (default: true). Bulk scans should turn this off.
    pub fill_cache: bool,

    /// Read as of this snapshot instead of the latest state.
    pub snapshot: Option<Arc<Snapshot>>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: false,
            fill_cache: true,
            snapshot: None,
        }
    }
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verify_checksums(mut self, yes: bool) -> Self {
        self.verify_checksums = yes;
        self
    }

    pub fn fill_cache(mut self, yes: bool) -> Self {
        self.fill_cache = yes;
        self
    }

    pub fn snapshot(mut self, snapshot: Arc<Snapshot>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }
}

/// Options for write operations.
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    /// Force the WAL to stable storage before acknowledging the write.
    /// Non-sync writes survive process crashes but may be lost on machine
    /// crashes (default: false).
    pub sync: bool,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync(mut self, yes: bool) -> Self {
        self.sync = yes;
        self
    }
}
