//! Log writer: frames records into 32 KiB blocks.

use crate::env::WritableFile;
use crate::error::Result;
use crate::util::coding::put_fixed32;
use crate::util::crc32c;

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE};

pub struct Writer {
    dest: Box<dyn WritableFile>,
    // Offset within the current block.
    block_offset: usize,
}

impl Writer {
    pub fn new(dest: Box<dyn WritableFile>) -> Self {
        Writer {
            dest,
            block_offset: 0,
        }
    }

    /// For reopening a log being appended to; `dest_length` is the
    /// current file size.
    pub fn with_dest_length(dest: Box<dyn WritableFile>, dest_length: u64) -> Self {
        Writer {
            dest,
            block_offset: (dest_length % BLOCK_SIZE as u64) as usize,
        }
    }

    pub fn add_record(&mut self, record: &[u8]) -> Result<()> {
        let mut remaining = record;
        let mut begin = true;
        // Empty records still emit one zero-length Full fragment.
        loop {
            debug_assert!(self.block_offset <= BLOCK_SIZE);
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                if leftover > 0 {
                    // Fill the tail with zeros; readers skip zero-type
                    // fragments.
                    self.dest.append(&[0u8; HEADER_SIZE - 1][..leftover])?;
                }
                self.block_offset = 0;
            }

            let available = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = remaining.len().min(available);
            let end = fragment_length == remaining.len();

            let rtype = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            self.emit_physical_record(rtype, &remaining[..fragment_length])?;
            remaining = &remaining[fragment_length..];
            begin = false;
            if end {
                break;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.dest.flush()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.dest.sync()
    }

    fn emit_physical_record(&mut self, rtype: RecordType, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() <= 0xffff);
        debug_assert!(self.block_offset + HEADER_SIZE + payload.len() <= BLOCK_SIZE);

        let crc = crc32c::extend(&[rtype as u8], payload);
        let mut header = Vec::with_capacity(HEADER_SIZE);
        put_fixed32(&mut header, crc32c::mask(crc));
        header.push((payload.len() & 0xff) as u8);
        header.push((payload.len() >> 8) as u8);
        header.push(rtype as u8);

        self.dest.append(&header)?;
        self.dest.append(payload)?;
        self.dest.flush()?;
        self.block_offset += HEADER_SIZE + payload.len();
        Ok(())
    }
}
