//! Write-ahead log format.
//!
//! Both the data log and the manifest use this framing. A file is a
//! sequence of 32 KiB blocks; a logical record is carried by one or more
//! physical fragments, each with a 7-byte header:
//!
//! ```text
//! +---------------------+------------+---------+----------------+
//! | masked crc32c (u32) | length u16 | type u8 | payload...     |
//! +---------------------+------------+---------+----------------+
//! ```
//!
//! The checksum covers the type byte and the payload and is stored
//! masked. A record that fits the remainder of a block is written as one
//! `Full` fragment; otherwise it is split into `First`, zero or more
//! `Middle`, and a `Last` fragment. When fewer than 7 bytes remain in a
//! block the writer zero-fills them and starts a fresh block, so a
//! reader can treat a zero type as padding.

pub mod reader;
pub mod writer;

pub use reader::{Reader, Reporter};
pub use writer::Writer;

pub const BLOCK_SIZE: usize = 32768;
pub const HEADER_SIZE: usize = 4 + 2 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Padding or a preallocated region; skipped silently.
    Zero = 0,
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

pub const MAX_RECORD_TYPE: u8 = RecordType::Last as u8;

impl RecordType {
    pub fn from_byte(b: u8) -> Option<RecordType> {
        match b {
            0 => Some(RecordType::Zero),
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            _ => None,
        }
    }
}
