//! Log reader: reassembles logical records and resynchronizes after
//! corruption or a torn tail.

use crate::env::SequentialFile;
use crate::util::coding::decode_fixed32;
use crate::util::crc32c;

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE};

/// Receives notice of skipped bytes. Corruption is reported and skipped;
/// a clean end-of-file (including a torn final record from a crashed
/// writer) is not reported.
pub trait Reporter: Send {
    fn corruption(&mut self, bytes: usize, reason: &str);
}

enum Physical {
    Record(RecordType, Vec<u8>),
    // Malformed or filtered; resume scanning.
    Bad,
    Eof,
    Unknown(u8, usize),
}

pub struct Reader {
    file: Box<dyn SequentialFile>,
    reporter: Option<Box<dyn Reporter>>,
    checksum: bool,

    buf: Vec<u8>,
    buf_pos: usize,
    eof: bool,

    /// Offset of the start of the last record returned.
    last_record_offset: u64,
    /// Offset just past the end of `buf` in the file.
    end_of_buffer_offset: u64,

    initial_offset: u64,
    /// True while discarding continuation fragments of a record that
    /// started before `initial_offset`.
    resyncing: bool,
}

impl Reader {
    pub fn new(
        file: Box<dyn SequentialFile>,
        reporter: Option<Box<dyn Reporter>>,
        checksum: bool,
        initial_offset: u64,
    ) -> Self {
        Reader {
            file,
            reporter,
            checksum,
            buf: Vec::new(),
            buf_pos: 0,
            eof: false,
            last_record_offset: 0,
            end_of_buffer_offset: 0,
            initial_offset,
            resyncing: initial_offset > 0,
        }
    }

    /// Offset of the start of the last record returned by `read_record`.
    pub fn last_record_offset(&self) -> u64 {
        self.last_record_offset
    }

    /// Returns the next logical record, or None at end of file.
    pub fn read_record(&mut self) -> Option<Vec<u8>> {
        if self.last_record_offset < self.initial_offset && !self.skip_to_initial_block() {
            return None;
        }

        let mut scratch: Vec<u8> = Vec::new();
        let mut in_fragmented_record = false;
        // Offset of the first fragment of the record being assembled.
        let mut prospective_record_offset = 0u64;

        loop {
            let physical = self.read_physical_record();
            let fragment_size = match &physical {
                Physical::Record(_, data) => data.len(),
                _ => 0,
            };
            let physical_record_offset = self
                .end_of_buffer_offset
                .wrapping_sub(self.remaining() as u64)
                .wrapping_sub(HEADER_SIZE as u64)
                .wrapping_sub(fragment_size as u64);

            if self.resyncing {
                match physical {
                    Physical::Record(RecordType::Middle, _) => continue,
                    Physical::Record(RecordType::Last, _) => {
                        self.resyncing = false;
                        continue;
                    }
                    _ => self.resyncing = false,
                }
            }

            match physical {
                Physical::Record(RecordType::Full, fragment) => {
                    if in_fragmented_record && !scratch.is_empty() {
                        self.report(scratch.len(), "partial record without end(1)");
                    }
                    self.last_record_offset = physical_record_offset;
                    return Some(fragment);
                }
                Physical::Record(RecordType::First, fragment) => {
                    if in_fragmented_record && !scratch.is_empty() {
                        self.report(scratch.len(), "partial record without end(2)");
                    }
                    prospective_record_offset = physical_record_offset;
                    scratch = fragment;
                    in_fragmented_record = true;
                }
                Physical::Record(RecordType::Middle, fragment) => {
                    if !in_fragmented_record {
                        self.report(fragment.len(), "missing start of fragmented record(1)");
                    } else {
                        scratch.extend_from_slice(&fragment);
                    }
                }
                Physical::Record(RecordType::Last, fragment) => {
                    if !in_fragmented_record {
                        self.report(fragment.len(), "missing start of fragmented record(2)");
                    } else {
                        scratch.extend_from_slice(&fragment);
                        self.last_record_offset = prospective_record_offset;
                        return Some(scratch);
                    }
                }
                Physical::Record(RecordType::Zero, _) => {
                    // Zero-type fragments with payload should not occur;
                    // zero-length ones are filtered below as Bad.
                    self.report(fragment_size, "zero-type record with payload");
                    in_fragmented_record = false;
                    scratch.clear();
                }
                Physical::Eof => {
                    // A fragmented record cut off at EOF means the writer
                    // crashed mid-append; swallow it without complaint.
                    return None;
                }
                Physical::Bad => {
                    if in_fragmented_record {
                        self.report(scratch.len(), "error in middle of record");
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                }
                Physical::Unknown(rtype, size) => {
                    self.report(
                        size + if in_fragmented_record { scratch.len() } else { 0 },
                        &format!("unknown record type {rtype}"),
                    );
                    in_fragmented_record = false;
                    scratch.clear();
                }
            }
        }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.buf_pos
    }

    fn report(&mut self, bytes: usize, reason: &str) {
        if self.end_of_buffer_offset
            .saturating_sub(self.remaining() as u64)
            .saturating_sub(bytes as u64)
            >= self.initial_offset
        {
            if let Some(reporter) = &mut self.reporter {
                reporter.corruption(bytes, reason);
            }
        }
    }

    fn skip_to_initial_block(&mut self) -> bool {
        let offset_in_block = self.initial_offset % BLOCK_SIZE as u64;
        let mut block_start = self.initial_offset - offset_in_block;
        // An offset in a block's trailer belongs to the next block.
        if offset_in_block > (BLOCK_SIZE - 6) as u64 {
            block_start += BLOCK_SIZE as u64;
        }
        self.end_of_buffer_offset = block_start;
        if block_start > 0 {
            if let Err(e) = self.file.skip(block_start) {
                if let Some(reporter) = &mut self.reporter {
                    reporter.corruption(block_start as usize, &e.to_string());
                }
                return false;
            }
        }
        true
    }

    fn read_physical_record(&mut self) -> Physical {
        loop {
            if self.remaining() < HEADER_SIZE {
                if !self.eof {
                    // Last read was a full block; fetch the next one.
                    self.buf.clear();
                    self.buf_pos = 0;
                    self.buf.resize(BLOCK_SIZE, 0);
                    match self.file.read(&mut self.buf) {
                        Ok(n) => {
                            self.buf.truncate(n);
                            self.end_of_buffer_offset += n as u64;
                            if n < BLOCK_SIZE {
                                self.eof = true;
                            }
                        }
                        Err(e) => {
                            self.buf.clear();
                            if let Some(reporter) = &mut self.reporter {
                                reporter.corruption(BLOCK_SIZE, &e.to_string());
                            }
                            self.eof = true;
                            return Physical::Eof;
                        }
                    }
                    continue;
                }
                // A truncated header at EOF is a torn write.
                self.buf_pos = self.buf.len();
                return Physical::Eof;
            }

            let header = &self.buf[self.buf_pos..self.buf_pos + HEADER_SIZE];
            let length = header[4] as usize | ((header[5] as usize) << 8);
            let rtype_byte = header[6];
            let stored_crc = decode_fixed32(&header[..4]);

            if HEADER_SIZE + length > self.remaining() {
                let drop_size = self.remaining();
                self.buf_pos = self.buf.len();
                if !self.eof {
                    self.report_drop(drop_size, "bad record length");
                    return Physical::Bad;
                }
                // The writer died mid-payload.
                return Physical::Eof;
            }

            if rtype_byte == RecordType::Zero as u8 && length == 0 {
                // Padding (or a preallocated region); skip silently.
                self.buf_pos = self.buf.len();
                return Physical::Bad;
            }

            let payload_start = self.buf_pos + HEADER_SIZE;
            if self.checksum {
                let expected = crc32c::unmask(stored_crc);
                let actual = crc32c::extend(
                    &[rtype_byte],
                    &self.buf[payload_start..payload_start + length],
                );
                if actual != expected {
                    // The whole rest of the block is suspect: the length
                    // field itself may be corrupt.
                    let drop_size = self.remaining();
                    self.buf_pos = self.buf.len();
                    self.report_drop(drop_size, "checksum mismatch");
                    return Physical::Bad;
                }
            }

            let payload = self.buf[payload_start..payload_start + length].to_vec();
            self.buf_pos += HEADER_SIZE + length;

            // Skip physical records that ended before the initial offset.
            if self
                .end_of_buffer_offset
                .wrapping_sub(self.remaining() as u64)
                .wrapping_sub(HEADER_SIZE as u64)
                .wrapping_sub(length as u64)
                < self.initial_offset
            {
                return Physical::Bad;
            }

            return match RecordType::from_byte(rtype_byte) {
                Some(rtype) => Physical::Record(rtype, payload),
                None => Physical::Unknown(rtype_byte, length),
            };
        }
    }

    fn report_drop(&mut self, bytes: usize, reason: &str) {
        if let Some(reporter) = &mut self.reporter {
            reporter.corruption(bytes, reason);
        }
    }
}
