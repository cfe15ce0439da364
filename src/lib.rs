//! cinderdb: an embedded, ordered, log-structured merge-tree key-value
//! store.
//!
//! Keys and values are arbitrary byte strings. Writes go to a
//! write-ahead log and an in-memory table; background work folds them
//! into sorted, immutable table files arranged in levels. Point reads,
//! ordered iteration, atomic batches, and consistent snapshots are
//! supported; a database directory may only be open in one process at a
//! time.
//!
//! ```no_run
//! use cinderdb::{Db, Options, ReadOptions, WriteOptions};
//!
//! let db = Db::open(Options::new().create_if_missing(true), "/tmp/demo-db")?;
//! db.put(&WriteOptions::default(), b"hello", b"world")?;
//! assert_eq!(
//!     db.get(&ReadOptions::new(), b"hello")?,
//!     Some(b"world".to_vec())
//! );
//! # Ok::<(), cinderdb::Error>(())
//! ```

pub mod batch;
pub mod config;
pub mod db;
pub mod env;
pub mod error;
pub mod iterator;
pub mod keys;
pub mod memtable;
pub mod skiplist;
pub mod sstable;
pub mod table_cache;
pub mod util;
pub mod version;
pub mod wal;

pub use batch::WriteBatch;
pub use config::{CompressionType, Options, ReadOptions, WriteOptions};
pub use db::dbiter::DbIter;
pub use db::snapshot::Snapshot;
pub use db::{destroy_db, Db};
pub use error::{Error, Result};
pub use util::bloom::{BloomFilterPolicy, FilterPolicy};
pub use util::comparator::{BytewiseComparator, Comparator};
