//! User-level iteration.
//!
//! The merged internal stream is ordered `(user key asc, sequence
//! desc)`; this wrapper projects it to one entry per user key as of a
//! fixed sequence, hiding shadowed versions and tombstoned keys.
//!
//! Direction is an explicit two-state machine because the projection
//! differs by direction: moving forward, the inner iterator sits exactly
//! on the emitted entry; moving backward it sits strictly before the
//! emitted entry, whose key and value are saved aside.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::Result;
use crate::iterator::Iter;
use crate::keys::{
    append_internal_key, extract_user_key, parse_internal_key, SequenceNumber, ValueType,
    VALUE_TYPE_FOR_SEEK,
};
use crate::util::comparator::Comparator;
use crate::util::random::Random;
use crate::version::Version;

use super::DbInner;

/// Emit a read sample roughly every megabyte of scanned data.
const READ_BYTES_PERIOD: u64 = 1_048_576;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

pub struct DbIter {
    db: Arc<DbInner>,
    user_comparator: Arc<dyn Comparator>,
    iter: Box<dyn Iter>,
    sequence: SequenceNumber,

    status: Result<()>,
    /// Current user key when reversed; scratch otherwise.
    saved_key: Vec<u8>,
    /// Current value when reversed.
    saved_value: Vec<u8>,
    direction: Direction,
    valid: bool,

    rnd: Random,
    bytes_until_read_sampling: u64,

    // Pins the file set the inner iterators read from.
    _version: Arc<Version>,
}

impl DbIter {
    pub(crate) fn new(
        db: Arc<DbInner>,
        user_comparator: Arc<dyn Comparator>,
        iter: Box<dyn Iter>,
        sequence: SequenceNumber,
        seed: u32,
        version: Arc<Version>,
    ) -> Self {
        let mut rnd = Random::new(seed);
        let bytes_until_read_sampling = random_compaction_period(&mut rnd);
        DbIter {
            db,
            user_comparator,
            iter,
            sequence,
            status: Ok(()),
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            direction: Direction::Forward,
            valid: false,
            rnd,
            bytes_until_read_sampling,
            _version: version,
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => extract_user_key(self.iter.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.iter.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    pub fn status(&self) -> Result<()> {
        self.status.clone()?;
        self.iter.status()
    }

    pub fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.iter.seek_to_first();
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.iter.seek_to_last();
        self.find_prev_user_entry();
    }

    pub fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.saved_key.clear();
        append_internal_key(
            &mut self.saved_key,
            target,
            self.sequence,
            VALUE_TYPE_FOR_SEEK,
        );
        let saved = std::mem::take(&mut self.saved_key);
        self.iter.seek(&saved);
        self.saved_key = saved;
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Reverse {
            self.direction = Direction::Forward;
            // The inner iterator is before the entry being returned, so
            // step onto it (or to the front) before advancing past the
            // saved user key below.
            if !self.iter.valid() {
                self.iter.seek_to_first();
            } else {
                self.iter.next();
            }
            if !self.iter.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
            // saved_key already holds the user key to skip.
        } else {
            let key = extract_user_key(self.iter.key()).to_vec();
            self.saved_key = key;
            self.iter.next();
            if !self.iter.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        }

        self.find_next_user_entry(true);
    }

    pub fn prev(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Forward {
            // The inner iterator sits on the current entry; back it up
            // until it is before every record of that user key.
            debug_assert!(self.iter.valid());
            self.saved_key = extract_user_key(self.iter.key()).to_vec();
            loop {
                self.iter.prev();
                if !self.iter.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                if self
                    .user_comparator
                    .compare(extract_user_key(self.iter.key()), &self.saved_key)
                    == Ordering::Less
                {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry();
    }

    /// Positions on the newest visible, non-deleted entry at or after
    /// the current inner position. When `skipping`, entries for
    /// `saved_key` (and keys shadowed by newer tombstones) are passed
    /// over.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert!(self.iter.valid());
        debug_assert!(self.direction == Direction::Forward);

        loop {
            self.sample_bytes_read();
            if let Some((user_key, seq, vtype)) = self.parse_current() {
                if seq <= self.sequence {
                    match vtype {
                        ValueType::Deletion => {
                            // Everything older for this key is shadowed.
                            self.saved_key = user_key;
                            skipping = true;
                        }
                        ValueType::Value => {
                            let hidden = skipping
                                && self
                                    .user_comparator
                                    .compare(&user_key, &self.saved_key)
                                    != Ordering::Greater;
                            if !hidden {
                                self.saved_key.clear();
                                self.valid = true;
                                return;
                            }
                        }
                    }
                }
            }
            self.iter.next();
            if !self.iter.valid() {
                break;
            }
        }
        self.saved_key.clear();
        self.valid = false;
    }

    /// Walks backward accumulating the newest visible record of the
    /// previous user key; reports it unless that record is a tombstone.
    fn find_prev_user_entry(&mut self) {
        debug_assert!(self.direction == Direction::Reverse);

        let mut value_type = ValueType::Deletion;
        if self.iter.valid() {
            loop {
                self.sample_bytes_read();
                if let Some((user_key, seq, vtype)) = self.parse_current() {
                    if seq <= self.sequence {
                        if value_type != ValueType::Deletion
                            && self.user_comparator.compare(&user_key, &self.saved_key)
                                == Ordering::Less
                        {
                            // Crossed into an earlier user key; the
                            // accumulated entry wins.
                            break;
                        }
                        value_type = vtype;
                        if value_type == ValueType::Deletion {
                            self.saved_key.clear();
                            self.saved_value.clear();
                        } else {
                            self.saved_key = user_key;
                            self.saved_value = self.iter.value().to_vec();
                        }
                    }
                }
                self.iter.prev();
                if !self.iter.valid() {
                    break;
                }
            }
        }

        if value_type == ValueType::Deletion {
            // Hit the front of the stream.
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }

    /// Parses the current inner entry, recording corruption once.
    fn parse_current(&mut self) -> Option<(Vec<u8>, SequenceNumber, ValueType)> {
        match parse_internal_key(self.iter.key()) {
            Some(parsed) => Some((
                parsed.user_key.to_vec(),
                parsed.sequence,
                parsed.value_type,
            )),
            None => {
                if self.status.is_ok() {
                    self.status =
                        Err(crate::error::Error::corruption("corrupted internal key in DbIter"));
                }
                None
            }
        }
    }

    /// Charges periodic read samples so scan-heavy workloads steer
    /// compaction like point reads do.
    fn sample_bytes_read(&mut self) {
        let bytes_read = (self.iter.key().len() + self.iter.value().len()) as u64;
        while self.bytes_until_read_sampling < bytes_read {
            self.bytes_until_read_sampling += random_compaction_period(&mut self.rnd);
            self.db.record_read_sample(self.iter.key());
        }
        self.bytes_until_read_sampling -= bytes_read;
    }
}

fn random_compaction_period(rnd: &mut Random) -> u64 {
    rnd.uniform(2 * READ_BYTES_PERIOD as u32) as u64
}
