//! Streaming table construction.
//!
//! Entries arrive in key order. Data blocks are cut when they reach the
//! configured size; each finished block produces a pending index entry
//! whose key is the shortest separator between the block's last key and
//! the next block's first key. The filter builder is driven by the
//! post-compression file offset so its regions line up with what readers
//! compute from block handles.

use crate::config::{CompressionType, Options};
use crate::env::WritableFile;
use crate::error::Result;
use crate::util::bloom::FilterPolicy;
use crate::util::comparator::Comparator;
use crate::util::compress;
use crate::util::crc32c;

use super::block_builder::BlockBuilder;
use super::filter_block::FilterBlockBuilder;
use super::footer::{BlockHandle, Footer};

pub struct TableBuilder {
    options: Options,
    file: Box<dyn WritableFile>,
    offset: u64,
    status: Result<()>,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    last_key: Vec<u8>,
    num_entries: u64,
    closed: bool,
    filter_block: Option<FilterBlockBuilder>,

    /// True between flushing a data block and seeing the next key; the
    /// index entry waits so its key can separate the two blocks.
    pending_index_entry: bool,
    pending_handle: BlockHandle,
}

impl TableBuilder {
    pub fn new(options: Options, file: Box<dyn WritableFile>) -> Self {
        let mut filter_block = options
            .filter_policy
            .as_ref()
            .map(|policy| FilterBlockBuilder::new(policy.clone()));
        if let Some(fb) = &mut filter_block {
            fb.start_block(0);
        }
        let restart_interval = options.block_restart_interval;
        TableBuilder {
            data_block: BlockBuilder::new(restart_interval),
            // Index keys are far apart; restarting on every entry keeps
            // binary search exact.
            index_block: BlockBuilder::new(1),
            options,
            file,
            offset: 0,
            status: Ok(()),
            last_key: Vec::new(),
            num_entries: 0,
            closed: false,
            filter_block,
            pending_index_entry: false,
            pending_handle: BlockHandle::default(),
        }
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.closed);
        if self.status.is_err() {
            return;
        }
        if self.num_entries > 0 {
            debug_assert!(
                self.options
                    .comparator
                    .compare(key, &self.last_key)
                    .is_gt(),
                "keys added out of order"
            );
        }

        if self.pending_index_entry {
            debug_assert!(self.data_block.is_empty());
            self.options
                .comparator
                .find_shortest_separator(&mut self.last_key, key);
            let handle = self.pending_handle.encoded();
            let last_key = std::mem::take(&mut self.last_key);
            self.index_block.add(&last_key, &handle);
            self.last_key = last_key;
            self.pending_index_entry = false;
        }

        if let Some(fb) = &mut self.filter_block {
            fb.add_key(key);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush();
        }
    }

    /// Forces the current data block out. Advanced use; `add` calls this
    /// on its own when a block fills.
    pub fn flush(&mut self) {
        debug_assert!(!self.closed);
        if self.status.is_err() || self.data_block.is_empty() {
            return;
        }
        debug_assert!(!self.pending_index_entry);
        let handle = self.write_data_block();
        if let Ok(handle) = handle {
            self.pending_handle = handle;
            self.pending_index_entry = true;
            if let Err(e) = self.file.flush() {
                self.status = Err(e);
            }
        }
        if let Some(fb) = &mut self.filter_block {
            fb.start_block(self.offset);
        }
    }

    fn write_data_block(&mut self) -> Result<BlockHandle> {
        let raw = self.data_block.finish().to_vec();
        self.data_block.reset();
        self.write_block(&raw)
    }

    /// Compresses (when profitable) and writes one block, returning its
    /// handle.
    fn write_block(&mut self, raw: &[u8]) -> Result<BlockHandle> {
        let (payload, ctype) = match self.options.compression {
            CompressionType::None => (raw.to_vec(), CompressionType::None),
            configured => {
                match compress::compress(configured, self.options.zstd_compression_level, raw) {
                    // Store raw unless compression wins back at least 1/8.
                    Ok(compressed) if compressed.len() < raw.len() - raw.len() / 8 => {
                        (compressed, configured)
                    }
                    _ => (raw.to_vec(), CompressionType::None),
                }
            }
        };
        let result = self.write_raw_block(&payload, ctype);
        if let Err(e) = &result {
            self.status = Err(e.clone());
        }
        result
    }

    fn write_raw_block(&mut self, data: &[u8], ctype: CompressionType) -> Result<BlockHandle> {
        let handle = BlockHandle::new(self.offset, data.len() as u64);
        self.file.append(data)?;

        let type_byte = [ctype.to_byte()];
        let crc = crc32c::extend(data, &type_byte);
        let mut trailer = Vec::with_capacity(super::BLOCK_TRAILER_SIZE);
        trailer.push(ctype.to_byte());
        crate::util::coding::put_fixed32(&mut trailer, crc32c::mask(crc));
        self.file.append(&trailer)?;

        self.offset += (data.len() + super::BLOCK_TRAILER_SIZE) as u64;
        Ok(handle)
    }

    /// Writes the filter, metaindex, index and footer, completing the
    /// table. No further mutation is allowed.
    pub fn finish(&mut self) -> Result<()> {
        self.flush();
        debug_assert!(!self.closed);
        self.closed = true;
        self.status.clone()?;

        // Filter block (never compressed: it is read before the policy
        // can be consulted).
        let mut filter_handle = None;
        if let Some(mut fb) = self.filter_block.take() {
            let contents = fb.finish().to_vec();
            filter_handle = Some(self.write_raw_block(&contents, CompressionType::None)?);
        }

        // Metaindex block.
        let mut metaindex = BlockBuilder::new(self.options.block_restart_interval);
        if let (Some(handle), Some(policy)) = (filter_handle, &self.options.filter_policy) {
            let key = format!("filter.{}", policy.name());
            metaindex.add(key.as_bytes(), &handle.encoded());
        }
        let metaindex_contents = metaindex.finish().to_vec();
        let metaindex_handle = self.write_block(&metaindex_contents)?;

        // Index block.
        if self.pending_index_entry {
            self.options.comparator.find_short_successor(&mut self.last_key);
            let handle = self.pending_handle.encoded();
            let last_key = std::mem::take(&mut self.last_key);
            self.index_block.add(&last_key, &handle);
            self.last_key = last_key;
            self.pending_index_entry = false;
        }
        let index_contents = self.index_block.finish().to_vec();
        let index_handle = self.write_block(&index_contents)?;

        let footer = Footer {
            metaindex_handle,
            index_handle,
        };
        let mut encoded = Vec::new();
        footer.encode_to(&mut encoded);
        self.file.append(&encoded)?;
        self.offset += encoded.len() as u64;
        self.status.clone()
    }

    /// Marks the builder finished without writing a footer, for error
    /// paths that will delete the file.
    pub fn abandon(&mut self) {
        debug_assert!(!self.closed);
        self.closed = true;
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync()
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written so far; the final file size once `finish` returns.
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    pub fn status(&self) -> Result<()> {
        self.status.clone()
    }
}

impl std::fmt::Debug for TableBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableBuilder")
            .field("offset", &self.offset)
            .field("num_entries", &self.num_entries)
            .field("closed", &self.closed)
            .finish()
    }
}
