//! Cache of open table files.
//!
//! Maps `file_number → Table` through the shared LRU so at most
//! `max_open_files` tables stay open. Iterators pin their table by
//! holding the cache handle (an `Arc`), so eviction never closes a file
//! out from under a reader.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{Options, ReadOptions};
use crate::db::filename::{sst_table_file_name, table_file_name};
use crate::env::Env;
use crate::error::Result;
use crate::iterator::{EmptyIter, Iter};
use crate::sstable::Table;
use crate::util::cache::Cache;

pub struct TableCache {
    dbname: PathBuf,
    /// Table-level options; the comparator here is the internal-key
    /// comparator.
    options: Options,
    cache: Cache<u64, Table>,
}

impl TableCache {
    pub fn new(dbname: PathBuf, options: Options, entries: usize) -> Self {
        TableCache {
            dbname,
            options,
            cache: Cache::new(entries),
        }
    }

    /// Opens (or fetches from cache) the table for `file_number`.
    pub fn find_table(&self, file_number: u64, file_size: u64) -> Result<Arc<Table>> {
        if let Some(table) = self.cache.lookup(&file_number) {
            return Ok(table);
        }

        let env = self.options.env.clone();
        let path = table_file_name(&self.dbname, file_number);
        let file = match env.new_random_access_file(&path) {
            Ok(file) => file,
            Err(open_err) => {
                // Tables written by older releases carry the .sst suffix.
                let old_path = sst_table_file_name(&self.dbname, file_number);
                match env.new_random_access_file(&old_path) {
                    Ok(file) => file,
                    Err(_) => return Err(open_err),
                }
            }
        };

        let table = Table::open(self.options.clone(), file, file_size)?;
        Ok(self.cache.insert(file_number, table, 1))
    }

    /// Iterator over the given file. Errors surface through the returned
    /// iterator's status. The table handle rides inside the iterator's
    /// block function, keeping the cache entry pinned.
    pub fn new_iterator(
        &self,
        read_options: &ReadOptions,
        file_number: u64,
        file_size: u64,
    ) -> Box<dyn Iter> {
        match self.find_table(file_number, file_size) {
            Ok(table) => Box::new(table.iter(read_options)),
            Err(e) => Box::new(EmptyIter::with_error(e)),
        }
    }

    /// Point lookup within one file; see `Table::internal_get`.
    pub fn get(
        &self,
        read_options: &ReadOptions,
        file_number: u64,
        file_size: u64,
        internal_key: &[u8],
        found: &mut dyn FnMut(&[u8], &[u8]),
    ) -> Result<()> {
        let table = self.find_table(file_number, file_size)?;
        table.internal_get(read_options, internal_key, found)
    }

    /// Called when `file_number` is deleted so the slot is not wasted.
    pub fn evict(&self, file_number: u64) {
        self.cache.erase(&file_number);
    }

    /// Approximate offset of `internal_key` within the given file.
    pub fn approximate_offset_of(
        &self,
        file_number: u64,
        file_size: u64,
        internal_key: &[u8],
    ) -> u64 {
        match self.find_table(file_number, file_size) {
            Ok(table) => table.approximate_offset_of(internal_key),
            Err(_) => 0,
        }
    }
}
