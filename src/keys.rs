//! Internal key format.
//!
//! Every record in the memtable and in table files carries an internal
//! key: the user key followed by an 8-byte little-endian tag packing a
//! 56-bit sequence number with a one-byte value type:
//!
//! ```text
//! +----------------+---------------------------+
//! | user key       | (sequence << 8) | type    |
//! +----------------+---------------------------+
//! |    var len     |      8 bytes, LE          |
//! +----------------+---------------------------+
//! ```
//!
//! Internal keys order by user key ascending, then sequence descending,
//! then type descending, so a seek for `(key, seq)` lands on the newest
//! entry for `key` visible at `seq`.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::util::coding::{
    decode_fixed64, get_length_prefixed_slice, put_fixed64, put_varint32, varint_length,
};
use crate::util::comparator::Comparator;

pub type SequenceNumber = u64;

/// Sequence numbers are packed into 56 bits.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueType {
    Deletion = 0,
    Value = 1,
}

/// The tag type used when constructing seek targets: the largest type
/// byte, so the seek lands on the newest entry with sequence <= the
/// target.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl ValueType {
    pub fn from_byte(b: u8) -> Option<ValueType> {
        match b {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            _ => None,
        }
    }
}

pub fn pack_sequence_and_type(seq: SequenceNumber, t: ValueType) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE_NUMBER);
    (seq << 8) | t as u64
}

/// Appends the internal-key encoding of `(user_key, seq, t)` to `dst`.
pub fn append_internal_key(dst: &mut Vec<u8>, user_key: &[u8], seq: SequenceNumber, t: ValueType) {
    dst.extend_from_slice(user_key);
    put_fixed64(dst, pack_sequence_and_type(seq, t));
}

/// The user-key portion of an encoded internal key.
pub fn extract_user_key(ikey: &[u8]) -> &[u8] {
    debug_assert!(ikey.len() >= 8);
    &ikey[..ikey.len() - 8]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
}

/// Splits an encoded internal key into its parts. Returns None when the
/// encoding is malformed.
pub fn parse_internal_key(ikey: &[u8]) -> Option<ParsedInternalKey<'_>> {
    if ikey.len() < 8 {
        return None;
    }
    let tag = decode_fixed64(&ikey[ikey.len() - 8..]);
    let value_type = ValueType::from_byte((tag & 0xff) as u8)?;
    Some(ParsedInternalKey {
        user_key: &ikey[..ikey.len() - 8],
        sequence: tag >> 8,
        value_type,
    })
}

/// An owned internal key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InternalKey {
    rep: Vec<u8>,
}

impl InternalKey {
    pub fn new(user_key: &[u8], seq: SequenceNumber, t: ValueType) -> Self {
        let mut rep = Vec::with_capacity(user_key.len() + 8);
        append_internal_key(&mut rep, user_key, seq, t);
        InternalKey { rep }
    }

    pub fn decode_from(encoded: &[u8]) -> Result<Self> {
        if encoded.len() < 8 {
            return Err(Error::corruption("internal key too short"));
        }
        Ok(InternalKey {
            rep: encoded.to_vec(),
        })
    }

    pub fn encoded(&self) -> &[u8] {
        &self.rep
    }

    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.rep)
    }

    pub fn is_empty(&self) -> bool {
        self.rep.is_empty()
    }

    pub fn clear(&mut self) {
        self.rep.clear();
    }
}

/// Orders internal keys: user key ascending per the user comparator, then
/// sequence descending, then type descending.
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    pub fn new(user: Arc<dyn Comparator>) -> Self {
        InternalKeyComparator { user }
    }

    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user
    }

    pub fn compare_internal_keys(&self, a: &InternalKey, b: &InternalKey) -> Ordering {
        self.compare(a.encoded(), b.encoded())
    }
}

impl Comparator for InternalKeyComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.user.compare(extract_user_key(a), extract_user_key(b)) {
            Ordering::Equal => {
                let atag = decode_fixed64(&a[a.len() - 8..]);
                let btag = decode_fixed64(&b[b.len() - 8..]);
                // Larger tag (newer sequence, then larger type) sorts first.
                btag.cmp(&atag)
            }
            other => other,
        }
    }

    fn name(&self) -> &str {
        "cinderdb.InternalKeyComparator"
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let mut tmp = user_start.to_vec();
        self.user.find_shortest_separator(&mut tmp, user_limit);
        if tmp.len() < user_start.len() && self.user.compare(user_start, &tmp) == Ordering::Less {
            // A shorter user key was found; tag it with the maximal
            // sequence so it sorts before every real entry for that key.
            put_fixed64(
                &mut tmp,
                pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert_eq!(self.compare(start, &tmp), Ordering::Less);
            debug_assert_eq!(self.compare(&tmp, limit), Ordering::Less);
            *start = tmp;
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        let user_key = extract_user_key(key);
        let mut tmp = user_key.to_vec();
        self.user.find_short_successor(&mut tmp);
        if tmp.len() < user_key.len() && self.user.compare(user_key, &tmp) == Ordering::Less {
            put_fixed64(
                &mut tmp,
                pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert_eq!(self.compare(key, &tmp), Ordering::Less);
            *key = tmp;
        }
    }
}

/// A probe key for memtable and table lookups.
///
/// Encodes `varint32(klen+8) ‖ user_key ‖ tag` once, then exposes the
/// three framings lookups need:
///
/// ```text
/// +-----------+----------+---------+
/// | klen+8    | user_key | tag     |
/// +-----------+----------+---------+
/// ^ memtable_key
///             ^ internal_key ... user_key ends 8 bytes early
/// ```
pub struct LookupKey {
    data: Vec<u8>,
    kstart: usize,
}

impl LookupKey {
    pub fn new(user_key: &[u8], seq: SequenceNumber) -> Self {
        let internal_len = user_key.len() + 8;
        let mut data = Vec::with_capacity(varint_length(internal_len as u64) + internal_len);
        put_varint32(&mut data, internal_len as u32);
        let kstart = data.len();
        data.extend_from_slice(user_key);
        put_fixed64(&mut data, pack_sequence_and_type(seq, VALUE_TYPE_FOR_SEEK));
        LookupKey { data, kstart }
    }

    /// The full length-prefixed form the memtable stores.
    pub fn memtable_key(&self) -> &[u8] {
        &self.data
    }

    /// The internal-key form tables index.
    pub fn internal_key(&self) -> &[u8] {
        &self.data[self.kstart..]
    }

    pub fn user_key(&self) -> &[u8] {
        &self.data[self.kstart..self.data.len() - 8]
    }
}

/// Reads a length-prefixed internal key, as stored in memtable entries.
pub fn get_length_prefixed_internal_key<'a>(input: &mut &'a [u8]) -> Option<&'a [u8]> {
    get_length_prefixed_slice(input)
}

use crate::util::bloom::FilterPolicy;

/// Adapts a user-key filter policy to the internal keys tables store:
/// filters are built over (and probed with) the user-key portion only.
pub struct InternalFilterPolicy {
    user: Arc<dyn FilterPolicy>,
}

impl InternalFilterPolicy {
    pub fn new(user: Arc<dyn FilterPolicy>) -> Self {
        InternalFilterPolicy { user }
    }
}

impl FilterPolicy for InternalFilterPolicy {
    fn name(&self) -> &str {
        self.user.name()
    }

    fn create_filter(&self, keys: &[&[u8]]) -> Vec<u8> {
        let user_keys: Vec<&[u8]> = keys.iter().map(|k| extract_user_key(k)).collect();
        self.user.create_filter(&user_keys)
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        self.user.key_may_match(extract_user_key(key), filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::comparator::BytewiseComparator;

    fn ikey(user_key: &[u8], seq: u64, t: ValueType) -> Vec<u8> {
        let mut v = Vec::new();
        append_internal_key(&mut v, user_key, seq, t);
        v
    }

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let keys: &[&[u8]] = &[b"", b"k", b"hello", b"longggggggggggggggggggggg"];
        let seqs = [0u64, 1, 100, u64::pow(2, 32) - 1, MAX_SEQUENCE_NUMBER];
        for &user_key in keys {
            for &seq in &seqs {
                for t in [ValueType::Value, ValueType::Deletion] {
                    let encoded = ikey(user_key, seq, t);
                    let parsed = parse_internal_key(&encoded).expect("parse failed");
                    assert_eq!(parsed.user_key, user_key);
                    assert_eq!(parsed.sequence, seq);
                    assert_eq!(parsed.value_type, t);
                }
            }
        }
    }

    #[test]
    fn test_parse_rejects_short_and_bad_type() {
        assert!(parse_internal_key(b"short").is_none());
        let mut bad = ikey(b"k", 7, ValueType::Value);
        let n = bad.len();
        bad[n - 8] = 99;
        assert!(parse_internal_key(&bad).is_none());
    }

    #[test]
    fn test_ordering_user_key_ascending() {
        let cmp = icmp();
        let a = ikey(b"a", 100, ValueType::Value);
        let b = ikey(b"b", 1, ValueType::Value);
        assert_eq!(cmp.compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_ordering_sequence_descending() {
        let cmp = icmp();
        let newer = ikey(b"k", 10, ValueType::Value);
        let older = ikey(b"k", 9, ValueType::Value);
        assert_eq!(cmp.compare(&newer, &older), Ordering::Less);
    }

    #[test]
    fn test_ordering_type_descending_at_same_sequence() {
        let cmp = icmp();
        let value = ikey(b"k", 5, ValueType::Value);
        let deletion = ikey(b"k", 5, ValueType::Deletion);
        assert_eq!(cmp.compare(&value, &deletion), Ordering::Less);
    }

    #[test]
    fn test_seek_key_lands_on_newest_visible() {
        // A probe at sequence S must sort at-or-before every entry with
        // sequence <= S and after entries with sequence > S.
        let cmp = icmp();
        let probe = LookupKey::new(b"k", 5);
        let newer = ikey(b"k", 6, ValueType::Value);
        let visible = ikey(b"k", 5, ValueType::Value);
        let older = ikey(b"k", 4, ValueType::Deletion);
        assert_eq!(cmp.compare(&newer, probe.internal_key()), Ordering::Less);
        assert!(cmp.compare(probe.internal_key(), &visible) != Ordering::Greater);
        assert_eq!(cmp.compare(probe.internal_key(), &older), Ordering::Less);
    }

    #[test]
    fn test_shortest_separator_keeps_internal_form() {
        let cmp = icmp();
        let mut start = ikey(b"foobar", 7, ValueType::Value);
        let limit = ikey(b"fozzz", 3, ValueType::Value);
        cmp.find_shortest_separator(&mut start, &limit);
        let parsed = parse_internal_key(&start).expect("separator must stay parseable");
        assert_eq!(parsed.user_key, b"fop");
        assert_eq!(parsed.sequence, MAX_SEQUENCE_NUMBER);
    }

    #[test]
    fn test_short_successor_keeps_internal_form() {
        let cmp = icmp();
        let mut key = ikey(b"abc", 42, ValueType::Value);
        let original = key.clone();
        cmp.find_short_successor(&mut key);
        let parsed = parse_internal_key(&key).expect("successor must stay parseable");
        assert_eq!(parsed.user_key, b"b");
        assert_eq!(cmp.compare(&original, &key), Ordering::Less);
    }

    #[test]
    fn test_lookup_key_framings() {
        let lk = LookupKey::new(b"user", 9);
        assert_eq!(lk.user_key(), b"user");
        assert_eq!(extract_user_key(lk.internal_key()), b"user");
        let mut mk = lk.memtable_key();
        let inner = get_length_prefixed_internal_key(&mut mk).expect("bad framing");
        assert_eq!(inner, lk.internal_key());
    }

    #[test]
    fn test_max_sequence_behaves_normally() {
        let cmp = icmp();
        let at_max = ikey(b"k", MAX_SEQUENCE_NUMBER, ValueType::Value);
        let below = ikey(b"k", MAX_SEQUENCE_NUMBER - 1, ValueType::Value);
        assert_eq!(cmp.compare(&at_max, &below), Ordering::Less);
        let parsed = parse_internal_key(&at_max).unwrap();
        assert_eq!(parsed.sequence, MAX_SEQUENCE_NUMBER);
    }
}
