//! Retention rules for the history log.
//!
//! Records are offered newest first. The first [`MANDATORY_TIMESTAMPS`] are
//! always kept. Past that window insertion records are dropped, and deletion
//! records are kept while the running total of deletion bytes stays within
//! [`deletion_reserve`]. The first deletion that does not fit, and every older
//! one, is evicted; the cutoff moves up to the newest evicted timestamp.

use smallvec::SmallVec;

use super::layout::{decode_history_record, deletion_reserve, HistoryRecord, MANDATORY_TIMESTAMPS};
use crate::types::Timestamp;

const HISTORY_SCRATCH_INLINE: usize = 512;

/// Running state of the retention rules over one newest-first pass.
#[derive(Clone, Debug)]
pub(crate) struct Retention {
    budget: usize,
    kept: usize,
    deletion_bytes: usize,
    evicting: bool,
    cutoff: Timestamp,
    bytes: usize,
}

impl Retention {
    pub(crate) fn new(block_size: usize, cutoff: Timestamp) -> Self {
        Self {
            budget: deletion_reserve(block_size),
            kept: 0,
            deletion_bytes: 0,
            evicting: false,
            cutoff,
            bytes: 0,
        }
    }

    /// Decides whether `record` survives; records must be offered newest first.
    pub(crate) fn admit(&mut self, record: &HistoryRecord<'_>) -> bool {
        let len = record.encoded_len();
        let keep = if self.kept < MANDATORY_TIMESTAMPS {
            true
        } else if record.is_deletion() {
            if !self.evicting && self.deletion_bytes + len <= self.budget {
                true
            } else {
                self.evicting = true;
                self.cutoff = self.cutoff.max(record.timestamp);
                false
            }
        } else {
            false
        };
        if keep {
            self.kept += 1;
            self.bytes += len;
            if record.is_deletion() {
                self.deletion_bytes += len;
            }
        }
        keep
    }

    /// Encoded size of the records kept so far.
    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    pub(crate) fn cutoff(&self) -> Timestamp {
        self.cutoff
    }
}

/// Encoded history log assembled off-block before being installed.
#[derive(Clone, Debug)]
pub(crate) struct HistoryImage {
    retention: Retention,
    bytes: SmallVec<[u8; HISTORY_SCRATCH_INLINE]>,
    count: u16,
}

impl HistoryImage {
    pub(crate) fn new(block_size: usize, cutoff: Timestamp) -> Self {
        Self {
            retention: Retention::new(block_size, cutoff),
            bytes: SmallVec::new(),
            count: 0,
        }
    }

    /// Offers the next-older record; returns whether it was kept.
    pub(crate) fn offer(&mut self, record: &HistoryRecord<'_>) -> bool {
        if !self.retention.admit(record) {
            return false;
        }
        record.encode_into(&mut self.bytes);
        self.count += 1;
        true
    }

    /// True when a deletion record for `key` has already been kept.
    pub(crate) fn contains_deletion_of(&self, key: &[u8]) -> bool {
        let mut pos = 0;
        for _ in 0..self.count {
            let Ok((record, len)) = decode_history_record(&self.bytes, pos) else {
                return false;
            };
            if record.deleted_key == Some(key) {
                return true;
            }
            pos += len;
        }
        false
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn count(&self) -> u16 {
        self.count
    }

    pub(crate) fn cutoff(&self) -> Timestamp {
        self.retention.cutoff()
    }
}

/// Tracks the newest [`MANDATORY_TIMESTAMPS`] entry timestamps.
#[derive(Clone, Debug, Default)]
pub(crate) struct NewestTimestamps {
    newest: SmallVec<[Timestamp; MANDATORY_TIMESTAMPS]>,
}

impl NewestTimestamps {
    pub(crate) fn observe(&mut self, timestamp: Timestamp) {
        let pos = self
            .newest
            .iter()
            .position(|existing| *existing < timestamp)
            .unwrap_or(self.newest.len());
        if pos < MANDATORY_TIMESTAMPS {
            self.newest.insert(pos, timestamp);
            self.newest.truncate(MANDATORY_TIMESTAMPS);
        }
    }

    fn iter(&self) -> impl Iterator<Item = Timestamp> + '_ {
        self.newest.iter().copied()
    }
}

/// Builds a fresh history log from routed deletion records and the timestamps
/// of the entries the node will hold.
///
/// Entry timestamps become insertion records so the mandatory window still
/// reflects the node's most recent writes. Duplicate deletions of one key
/// collapse to the newest.
pub(crate) fn rebuild(
    block_size: usize,
    cutoff: Timestamp,
    deletions: &mut [HistoryRecord<'_>],
    entries: &NewestTimestamps,
) -> HistoryImage {
    deletions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let mut image = HistoryImage::new(block_size, cutoff);
    let mut inserts = entries.iter().peekable();
    let mut dels = deletions.iter().peekable();
    loop {
        let take_deletion = match (dels.peek(), inserts.peek()) {
            (Some(del), Some(ins)) => del.timestamp >= *ins,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        if take_deletion {
            let Some(record) = dels.next() else { break };
            if let Some(key) = record.deleted_key {
                if image.contains_deletion_of(key) {
                    continue;
                }
            }
            image.offer(record);
        } else if let Some(timestamp) = inserts.next() {
            image.offer(&HistoryRecord::insertion(timestamp));
        }
    }
    image
}
