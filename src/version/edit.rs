//! Version edits: the atomic deltas recorded in the manifest.
//!
//! An edit is serialized as a sequence of tagged fields:
//!
//! ```text
//! tag 1  comparator        length-prefixed string
//! tag 2  log number        varint64
//! tag 3  next file number  varint64
//! tag 4  last sequence     varint64
//! tag 5  compact pointer   varint32 level ‖ length-prefixed internal key
//! tag 6  deleted file      varint32 level ‖ varint64 number
//! tag 7  new file          varint32 level ‖ varint64 number ‖ varint64 size
//!                          ‖ length-prefixed smallest ‖ length-prefixed largest
//! tag 9  prev log number   varint64
//! ```

use crate::error::{Error, Result};
use crate::keys::{InternalKey, SequenceNumber};
use crate::util::coding::{
    get_length_prefixed_slice, get_varint32, get_varint64, put_length_prefixed_slice,
    put_varint32, put_varint64,
};

use super::{FileMetaData, NUM_LEVELS};

const TAG_COMPARATOR: u32 = 1;
const TAG_LOG_NUMBER: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;
const TAG_COMPACT_POINTER: u32 = 5;
const TAG_DELETED_FILE: u32 = 6;
const TAG_NEW_FILE: u32 = 7;
const TAG_PREV_LOG_NUMBER: u32 = 9;

#[derive(Debug, Clone, Default)]
pub struct VersionEdit {
    pub comparator: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<SequenceNumber>,
    pub compact_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files: Vec<(usize, u64)>,
    pub new_files: Vec<(usize, FileMetaData)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator = Some(name.to_string());
    }

    pub fn set_log_number(&mut self, number: u64) {
        self.log_number = Some(number);
    }

    pub fn set_prev_log_number(&mut self, number: u64) {
        self.prev_log_number = Some(number);
    }

    pub fn set_next_file_number(&mut self, number: u64) {
        self.next_file_number = Some(number);
    }

    pub fn set_last_sequence(&mut self, seq: SequenceNumber) {
        self.last_sequence = Some(seq);
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    /// Records a table file addition at `level`.
    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.new_files.push((
            level,
            FileMetaData::new(number, file_size, smallest, largest),
        ));
    }

    /// Records a table file deletion at `level`.
    pub fn remove_file(&mut self, level: usize, number: u64) {
        self.deleted_files.push((level, number));
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        if let Some(name) = &self.comparator {
            put_varint32(dst, TAG_COMPARATOR);
            put_length_prefixed_slice(dst, name.as_bytes());
        }
        if let Some(n) = self.log_number {
            put_varint32(dst, TAG_LOG_NUMBER);
            put_varint64(dst, n);
        }
        if let Some(n) = self.prev_log_number {
            put_varint32(dst, TAG_PREV_LOG_NUMBER);
            put_varint64(dst, n);
        }
        if let Some(n) = self.next_file_number {
            put_varint32(dst, TAG_NEXT_FILE_NUMBER);
            put_varint64(dst, n);
        }
        if let Some(n) = self.last_sequence {
            put_varint32(dst, TAG_LAST_SEQUENCE);
            put_varint64(dst, n);
        }
        for (level, key) in &self.compact_pointers {
            put_varint32(dst, TAG_COMPACT_POINTER);
            put_varint32(dst, *level as u32);
            put_length_prefixed_slice(dst, key.encoded());
        }
        for (level, number) in &self.deleted_files {
            put_varint32(dst, TAG_DELETED_FILE);
            put_varint32(dst, *level as u32);
            put_varint64(dst, *number);
        }
        for (level, meta) in &self.new_files {
            put_varint32(dst, TAG_NEW_FILE);
            put_varint32(dst, *level as u32);
            put_varint64(dst, meta.number);
            put_varint64(dst, meta.file_size);
            put_length_prefixed_slice(dst, meta.smallest.encoded());
            put_length_prefixed_slice(dst, meta.largest.encoded());
        }
    }

    pub fn decode_from(src: &[u8]) -> Result<VersionEdit> {
        let mut edit = VersionEdit::new();
        let mut input = src;

        fn level(input: &mut &[u8]) -> Result<usize> {
            let level = get_varint32(input)
                .ok_or_else(|| Error::corruption("version edit: bad level"))? as usize;
            if level >= NUM_LEVELS {
                return Err(Error::corruption("version edit: level out of range"));
            }
            Ok(level)
        }

        fn internal_key(input: &mut &[u8]) -> Result<InternalKey> {
            let bytes = get_length_prefixed_slice(input)
                .ok_or_else(|| Error::corruption("version edit: bad internal key"))?;
            InternalKey::decode_from(bytes)
        }

        fn number(input: &mut &[u8], what: &str) -> Result<u64> {
            get_varint64(input)
                .ok_or_else(|| Error::corruption(format!("version edit: bad {what}")))
        }

        while !input.is_empty() {
            let tag = get_varint32(&mut input)
                .ok_or_else(|| Error::corruption("version edit: bad tag"))?;
            match tag {
                TAG_COMPARATOR => {
                    let name = get_length_prefixed_slice(&mut input)
                        .ok_or_else(|| Error::corruption("version edit: bad comparator"))?;
                    edit.comparator = Some(
                        String::from_utf8(name.to_vec())
                            .map_err(|_| Error::corruption("version edit: bad comparator"))?,
                    );
                }
                TAG_LOG_NUMBER => edit.log_number = Some(number(&mut input, "log number")?),
                TAG_PREV_LOG_NUMBER => {
                    edit.prev_log_number = Some(number(&mut input, "prev log number")?)
                }
                TAG_NEXT_FILE_NUMBER => {
                    edit.next_file_number = Some(number(&mut input, "next file number")?)
                }
                TAG_LAST_SEQUENCE => {
                    edit.last_sequence = Some(number(&mut input, "last sequence")?)
                }
                TAG_COMPACT_POINTER => {
                    let level = level(&mut input)?;
                    let key = internal_key(&mut input)?;
                    edit.compact_pointers.push((level, key));
                }
                TAG_DELETED_FILE => {
                    let level = level(&mut input)?;
                    let file_number = number(&mut input, "deleted file")?;
                    edit.deleted_files.push((level, file_number));
                }
                TAG_NEW_FILE => {
                    let level = level(&mut input)?;
                    let file_number = number(&mut input, "new file number")?;
                    let file_size = number(&mut input, "file size")?;
                    let smallest = internal_key(&mut input)?;
                    let largest = internal_key(&mut input)?;
                    edit.new_files.push((
                        level,
                        FileMetaData::new(file_number, file_size, smallest, largest),
                    ));
                }
                _ => return Err(Error::corruption("version edit: unknown tag")),
            }
        }
        Ok(edit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ValueType;

    fn roundtrip(edit: &VersionEdit) -> VersionEdit {
        let mut encoded = Vec::new();
        edit.encode_to(&mut encoded);
        let decoded = VersionEdit::decode_from(&encoded).expect("decode failed");
        let mut reencoded = Vec::new();
        decoded.encode_to(&mut reencoded);
        assert_eq!(encoded, reencoded, "encoding is not stable");
        decoded
    }

    #[test]
    fn test_roundtrip_all_fields() {
        let big = 1u64 << 50;
        let mut edit = VersionEdit::new();
        for i in 0..4 {
            edit.add_file(
                3,
                big + 300 + i,
                big + 400 + i,
                InternalKey::new(b"foo", big + 500 + i, ValueType::Value),
                InternalKey::new(b"zoo", big + 600 + i, ValueType::Deletion),
            );
            edit.remove_file(4, big + 700 + i);
            edit.set_compact_pointer(
                (i as usize) % NUM_LEVELS,
                InternalKey::new(b"x", big + 900 + i, ValueType::Value),
            );
        }
        edit.set_comparator_name("foo-cmp");
        edit.set_log_number(big + 100);
        edit.set_prev_log_number(99);
        edit.set_next_file_number(big + 200);
        edit.set_last_sequence(big + 1000);

        let decoded = roundtrip(&edit);
        assert_eq!(decoded.comparator.as_deref(), Some("foo-cmp"));
        assert_eq!(decoded.log_number, Some(big + 100));
        assert_eq!(decoded.prev_log_number, Some(99));
        assert_eq!(decoded.next_file_number, Some(big + 200));
        assert_eq!(decoded.last_sequence, Some(big + 1000));
        assert_eq!(decoded.new_files.len(), 4);
        assert_eq!(decoded.deleted_files.len(), 4);
        assert_eq!(decoded.new_files[0].1.number, big + 300);
        assert_eq!(decoded.new_files[0].1.smallest.user_key(), b"foo");
        assert_eq!(decoded.new_files[0].1.largest.user_key(), b"zoo");
    }

    #[test]
    fn test_empty_edit_roundtrips() {
        let decoded = roundtrip(&VersionEdit::new());
        assert!(decoded.comparator.is_none());
        assert!(decoded.new_files.is_empty());
        assert!(decoded.deleted_files.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(VersionEdit::decode_from(&[0xde, 0xad]).is_err());
        // Unknown tag.
        let mut bad = Vec::new();
        put_varint32(&mut bad, 8);
        assert!(VersionEdit::decode_from(&bad).is_err());
        // Level out of range.
        let mut bad = Vec::new();
        put_varint32(&mut bad, TAG_DELETED_FILE);
        put_varint32(&mut bad, NUM_LEVELS as u32);
        put_varint64(&mut bad, 5);
        assert!(VersionEdit::decode_from(&bad).is_err());
    }
}
