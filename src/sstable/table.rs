//! Table reader.

use std::sync::Arc;

use crate::config::{CompressionType, Options, ReadOptions};
use crate::env::RandomAccessFile;
use crate::error::{Error, Result};
use crate::iterator::{EmptyIter, Iter, TwoLevelIter};
use crate::util::bloom::FilterPolicy;
use crate::util::coding::decode_fixed32;
use crate::util::crc32c;
use crate::util::{compress, comparator::Comparator};

use super::block::Block;
use super::filter_block::FilterBlockReader;
use super::footer::{BlockHandle, Footer, FOOTER_SIZE};
use super::{BlockCacheKey, BLOCK_TRAILER_SIZE};

/// Reads one block (contents + trailer) from `file`, verifying and
/// decompressing as requested.
pub fn read_block(
    file: &dyn RandomAccessFile,
    verify_checksums: bool,
    handle: BlockHandle,
) -> Result<Block> {
    let n = handle.size as usize;
    let data = file.read_at(handle.offset, n + BLOCK_TRAILER_SIZE)?;
    if data.len() != n + BLOCK_TRAILER_SIZE {
        return Err(Error::corruption("truncated block read"));
    }

    let type_byte = data[n];
    if verify_checksums {
        let expected = crc32c::unmask(decode_fixed32(&data[n + 1..]));
        let actual = crc32c::extend(&data[..n], &[type_byte]);
        if actual != expected {
            return Err(Error::corruption("block checksum mismatch"));
        }
    }

    let ctype = CompressionType::from_byte(type_byte)
        .ok_or_else(|| Error::corruption("unknown block compression type"))?;
    let contents = match ctype {
        CompressionType::None => data[..n].to_vec(),
        _ => compress::decompress(ctype, &data[..n])?,
    };
    Block::new(contents)
}

/// An open, immutable table file. Shared by the table cache, iterators,
/// and point lookups via `Arc`.
pub struct Table {
    options: Options,
    file: Box<dyn RandomAccessFile>,
    cache_id: u64,
    filter: Option<FilterBlockReader>,
    metaindex_handle: BlockHandle,
    index_block: Arc<Block>,
}

impl Table {
    /// Opens a table over `file` of length `size`. The comparator in
    /// `options` must order the keys the file was built with.
    pub fn open(options: Options, file: Box<dyn RandomAccessFile>, size: u64) -> Result<Table> {
        if size < FOOTER_SIZE as u64 {
            return Err(Error::corruption("file is too short to be a table"));
        }
        let footer_input = file.read_at(size - FOOTER_SIZE as u64, FOOTER_SIZE)?;
        let footer = Footer::decode_from(&footer_input)?;

        let index_block = Arc::new(read_block(
            file.as_ref(),
            options.paranoid_checks,
            footer.index_handle,
        )?);

        let cache_id = options
            .block_cache
            .as_ref()
            .map(|cache| cache.new_id())
            .unwrap_or(0);

        let mut table = Table {
            options,
            file,
            cache_id,
            filter: None,
            metaindex_handle: footer.metaindex_handle,
            index_block,
        };
        table.read_filter(footer);
        Ok(table)
    }

    /// Loads the filter block when the metaindex advertises one for the
    /// configured policy. Failures are ignored: the filter is an
    /// optimization, not a correctness requirement.
    fn read_filter(&mut self, footer: Footer) {
        let policy = match &self.options.filter_policy {
            Some(policy) => policy.clone(),
            None => return,
        };
        let meta = match read_block(
            self.file.as_ref(),
            self.options.paranoid_checks,
            footer.metaindex_handle,
        ) {
            Ok(block) => Arc::new(block),
            Err(_) => return,
        };

        let key = format!("filter.{}", policy.name());
        let mut iter = meta.iter(self.options.comparator.clone());
        iter.seek(key.as_bytes());
        if !iter.valid() || iter.key() != key.as_bytes() {
            return;
        }
        let mut handle_bytes = iter.value();
        let handle = match BlockHandle::decode_from(&mut handle_bytes) {
            Ok(handle) => handle,
            Err(_) => return,
        };
        // Filter blocks are stored raw; reuse the block read path for the
        // trailer handling.
        let n = handle.size as usize;
        let data = match self.file.read_at(handle.offset, n + BLOCK_TRAILER_SIZE) {
            Ok(data) if data.len() == n + BLOCK_TRAILER_SIZE => data,
            _ => return,
        };
        let contents = match CompressionType::from_byte(data[n]) {
            Some(CompressionType::None) => data[..n].to_vec(),
            Some(ctype) => match compress::decompress(ctype, &data[..n]) {
                Ok(contents) => contents,
                Err(_) => return,
            },
            None => return,
        };
        self.filter = FilterBlockReader::new(policy, contents);
    }

    fn comparator(&self) -> Arc<dyn Comparator> {
        self.options.comparator.clone()
    }

    /// Materializes the data block an index entry points at, consulting
    /// the block cache.
    fn data_block(&self, read_options: &ReadOptions, index_value: &[u8]) -> Result<Arc<Block>> {
        let mut input = index_value;
        let handle = BlockHandle::decode_from(&mut input)?;

        if let Some(cache) = &self.options.block_cache {
            let key: BlockCacheKey = (self.cache_id, handle.offset);
            if let Some(block) = cache.lookup(&key) {
                return Ok(block);
            }
            let block = read_block(
                self.file.as_ref(),
                read_options.verify_checksums,
                handle,
            )?;
            if read_options.fill_cache {
                let charge = block.size();
                return Ok(cache.insert(key, block, charge));
            }
            return Ok(Arc::new(block));
        }

        Ok(Arc::new(read_block(
            self.file.as_ref(),
            read_options.verify_checksums,
            handle,
        )?))
    }

    /// Iterator over the whole table in key order.
    pub fn iter(self: &Arc<Self>, read_options: &ReadOptions) -> TwoLevelIter {
        let table = Arc::clone(self);
        let read_options = read_options.clone();
        let index_iter = self.index_block.iter(self.comparator());
        TwoLevelIter::new(
            Box::new(index_iter),
            Box::new(move |index_value: &[u8]| -> Box<dyn Iter> {
                match table.data_block(&read_options, index_value) {
                    Ok(block) => Box::new(block.iter(table.comparator())),
                    Err(e) => Box::new(EmptyIter::with_error(e)),
                }
            }),
        )
    }

    /// Point lookup: seeks to the first entry >= `key` and, if one exists
    /// in the candidate block, hands it to `found`. The filter is
    /// consulted first to skip definite misses.
    pub fn internal_get(
        &self,
        read_options: &ReadOptions,
        key: &[u8],
        found: &mut dyn FnMut(&[u8], &[u8]),
    ) -> Result<()> {
        let mut index_iter = self.index_block.iter(self.comparator());
        index_iter.seek(key);
        if index_iter.valid() {
            if let Some(filter) = &self.filter {
                let mut handle_bytes = index_iter.value();
                if let Ok(handle) = BlockHandle::decode_from(&mut handle_bytes) {
                    if !filter.key_may_match(handle.offset, key) {
                        return Ok(());
                    }
                }
            }
            let block = self.data_block(read_options, index_iter.value())?;
            let mut block_iter = block.iter(self.comparator());
            block_iter.seek(key);
            if block_iter.valid() {
                found(block_iter.key(), block_iter.value());
            }
            block_iter.status()?;
        }
        index_iter.status()
    }

    /// Approximate file offset at which `key` would live. Keys past the
    /// last entry map to the start of the metadata section.
    pub fn approximate_offset_of(&self, key: &[u8]) -> u64 {
        let mut index_iter = self.index_block.iter(self.comparator());
        index_iter.seek(key);
        if index_iter.valid() {
            let mut handle_bytes = index_iter.value();
            if let Ok(handle) = BlockHandle::decode_from(&mut handle_bytes) {
                return handle.offset;
            }
        }
        self.metaindex_handle.offset
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("cache_id", &self.cache_id)
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::env::WritableFile;
    use crate::sstable::{BlockCache, TableBuilder};
    use crate::util::bloom::BloomFilterPolicy;

    #[derive(Clone, Default)]
    struct MemFile(Arc<Mutex<Vec<u8>>>);

    struct MemWriter(MemFile);

    impl WritableFile for MemWriter {
        fn append(&mut self, data: &[u8]) -> Result<()> {
            self.0 .0.lock().unwrap().extend_from_slice(data);
            Ok(())
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
        fn sync(&mut self) -> Result<()> {
            Ok(())
        }
    }

    impl RandomAccessFile for MemFile {
        fn read_at(&self, offset: u64, n: usize) -> Result<Vec<u8>> {
            let data = self.0.lock().unwrap();
            let start = (offset as usize).min(data.len());
            let end = (start + n).min(data.len());
            Ok(data[start..end].to_vec())
        }
    }

    fn entries(n: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..n)
            .map(|i| {
                (
                    format!("key{i:05}").into_bytes(),
                    format!("value-{i}").repeat(1 + i % 7).into_bytes(),
                )
            })
            .collect()
    }

    fn build_table(options: &Options, entries: &[(Vec<u8>, Vec<u8>)]) -> (MemFile, u64) {
        let file = MemFile::default();
        let mut builder = TableBuilder::new(options.clone(), Box::new(MemWriter(file.clone())));
        for (k, v) in entries {
            builder.add(k, v);
        }
        builder.finish().expect("finish failed");
        let size = builder.file_size();
        assert_eq!(size as usize, file.0.lock().unwrap().len());
        (file, size)
    }

    fn test_options() -> Options {
        // Tiny blocks force a multi-block table.
        Options::new().block_size(256)
    }

    fn open(options: &Options, file: MemFile, size: u64) -> Arc<Table> {
        Arc::new(Table::open(options.clone(), Box::new(file), size).expect("open failed"))
    }

    #[test]
    fn test_build_then_scan() {
        let options = test_options();
        let data = entries(500);
        let (file, size) = build_table(&options, &data);
        let table = open(&options, file, size);

        let mut it = table.iter(&ReadOptions::new());
        it.seek_to_first();
        for (k, v) in &data {
            assert!(it.valid(), "iterator ended early");
            assert_eq!(it.key(), k.as_slice());
            assert_eq!(it.value(), v.as_slice());
            it.next();
        }
        assert!(!it.valid());
        assert!(it.status().is_ok());
    }

    #[test]
    fn test_seek_and_reverse_scan() {
        let options = test_options();
        let data = entries(300);
        let (file, size) = build_table(&options, &data);
        let table = open(&options, file, size);

        let mut it = table.iter(&ReadOptions::new());
        it.seek(b"key00100");
        assert!(it.valid());
        assert_eq!(it.key(), b"key00100");

        it.prev();
        assert_eq!(it.key(), b"key00099");

        it.seek_to_last();
        assert_eq!(it.key(), b"key00299");
        it.next();
        assert!(!it.valid());

        // Seeking between keys lands on the next one.
        it.seek(b"key00100a");
        assert_eq!(it.key(), b"key00101");
    }

    #[test]
    fn test_internal_get_hits_and_misses() {
        let options = test_options().filter_policy(Arc::new(BloomFilterPolicy::new(10)));
        let data = entries(200);
        let (file, size) = build_table(&options, &data);
        let table = open(&options, file, size);

        for (k, v) in &data {
            let mut got = None;
            table
                .internal_get(&ReadOptions::new(), k, &mut |fk, fv| {
                    if fk == k.as_slice() {
                        got = Some(fv.to_vec());
                    }
                })
                .expect("get failed");
            assert_eq!(got.as_deref(), Some(v.as_slice()), "key {k:?}");
        }

        let mut called_with_match = false;
        table
            .internal_get(&ReadOptions::new(), b"key99999", &mut |fk, _| {
                called_with_match = fk == b"key99999";
            })
            .expect("get failed");
        assert!(!called_with_match);
    }

    #[test]
    fn test_block_cache_serves_repeat_reads() {
        let cache = Arc::new(BlockCache::new(1 << 20));
        let options = test_options().block_cache(Arc::clone(&cache));
        let data = entries(300);
        let (file, size) = build_table(&options, &data);
        let table = open(&options, file, size);

        let ropts = ReadOptions::new();
        let mut first = None;
        table
            .internal_get(&ropts, b"key00042", &mut |_, v| first = Some(v.to_vec()))
            .unwrap();
        assert!(cache.total_charge() > 0);
        let mut second = None;
        table
            .internal_get(&ropts, b"key00042", &mut |_, v| second = Some(v.to_vec()))
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_zstd_table_roundtrip() {
        let options = test_options().compression(CompressionType::Zstd);
        let data = entries(300);
        let (file, size) = build_table(&options, &data);
        let table = open(&options, file, size);

        let mut it = table.iter(&ReadOptions::new().verify_checksums(true));
        it.seek_to_first();
        let mut count = 0;
        while it.valid() {
            count += 1;
            it.next();
        }
        assert!(it.status().is_ok());
        assert_eq!(count, 300);
    }

    #[test]
    fn test_uncompressed_table_roundtrip() {
        let options = test_options().compression(CompressionType::None);
        let data = entries(50);
        let (file, size) = build_table(&options, &data);
        let table = open(&options, file, size);
        let mut got = None;
        table
            .internal_get(&ReadOptions::new(), b"key00007", &mut |_, v| {
                got = Some(v.to_vec())
            })
            .unwrap();
        assert_eq!(got.as_deref(), Some(data[7].1.as_slice()));
    }

    #[test]
    fn test_approximate_offsets_are_monotonic() {
        let options = test_options();
        let data = entries(1000);
        let (file, size) = build_table(&options, &data);
        let table = open(&options, file, size);

        let early = table.approximate_offset_of(b"key00010");
        let middle = table.approximate_offset_of(b"key00500");
        let late = table.approximate_offset_of(b"key00990");
        let past = table.approximate_offset_of(b"zzz");
        assert!(early <= middle);
        assert!(middle < late, "{middle} vs {late}");
        assert!(late <= past);
        assert!(past <= size);
    }

    #[test]
    fn test_open_rejects_garbage() {
        let file = MemFile::default();
        file.0.lock().unwrap().extend_from_slice(&[0u8; 100]);
        assert!(Table::open(Options::default(), Box::new(file), 100).is_err());

        let tiny = MemFile::default();
        assert!(Table::open(Options::default(), Box::new(tiny), 0).is_err());
    }

    #[test]
    fn test_empty_table() {
        let options = test_options();
        let (file, size) = build_table(&options, &[]);
        let table = open(&options, file, size);
        let mut it = table.iter(&ReadOptions::new());
        it.seek_to_first();
        assert!(!it.valid());
        it.seek(b"anything");
        assert!(!it.valid());
    }
}
