//! Replication backfill: streaming what changed in a node after a timestamp.

use smallvec::SmallVec;

use super::node::Leaf;
use crate::storage::btree::sizer::ValueSizer;
use crate::types::{LeafError, Timestamp};

/// One live entry reported by [`dump_entries_since_time`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DumpedEntry<'a> {
    /// Key bytes.
    pub key: &'a [u8],
    /// Encoded value bytes.
    pub value: &'a [u8],
    /// Timestamp of the entry's last modification.
    pub timestamp: Timestamp,
}

/// Consumer of a backfill stream.
///
/// Calls arrive in a fixed order: at most one `lost_deletions`, then zero or
/// more `deletion`, then exactly one `keys_values`. An error from any callback
/// stops the dump and is returned to the caller unchanged.
pub trait EntryReceiver {
    /// Error type the receiver may fail with.
    type Error: From<LeafError>;

    /// Some deletions after the requested timestamp were forgotten; the
    /// receiver must drop its copy of this node's key range before applying
    /// the rest of the stream.
    fn lost_deletions(&mut self) -> Result<(), Self::Error>;

    /// `key` was deleted at `timestamp`.
    fn deletion(&mut self, key: &[u8], timestamp: Timestamp) -> Result<(), Self::Error>;

    /// Live entries modified after the requested timestamp, in key order.
    fn keys_values(&mut self, entries: &[DumpedEntry<'_>]) -> Result<(), Self::Error>;
}

/// Reports every change in `node` strictly after `minimum`.
///
/// Fails with [`LeafError::Corruption`] if any stored timestamp exceeds
/// `maximum_possible_timestamp`. Never modifies the node.
pub fn dump_entries_since_time<S, B, R>(
    sizer: &S,
    node: &Leaf<B>,
    minimum: Timestamp,
    maximum_possible_timestamp: Timestamp,
    receiver: &mut R,
) -> Result<(), R::Error>
where
    S: ValueSizer + ?Sized,
    B: AsRef<[u8]>,
    R: EntryReceiver + ?Sized,
{
    let cutoff = node.history_cutoff();
    let newest = node.newest_timestamp();
    if newest > maximum_possible_timestamp || cutoff > maximum_possible_timestamp {
        return Err(
            LeafError::Corruption("leaf timestamp beyond maximum possible timestamp").into(),
        );
    }
    for record in node.history() {
        if record?.timestamp > maximum_possible_timestamp {
            return Err(
                LeafError::Corruption("history timestamp beyond maximum possible timestamp").into(),
            );
        }
    }

    if minimum < cutoff {
        tracing::debug!(
            target: "leafnode::dump",
            minimum = minimum.0,
            cutoff = cutoff.0,
            "deletion history incomplete for requested range"
        );
        receiver.lost_deletions()?;
    }
    for record in node.history() {
        let record = record?;
        if let Some(key) = record.deleted_key {
            if record.timestamp > minimum {
                receiver.deletion(key, record.timestamp)?;
            }
        }
    }

    let mut batch: SmallVec<[DumpedEntry<'_>; 32]> = SmallVec::new();
    if newest > minimum {
        for idx in 0..node.num_pairs() {
            let pair = node.pair_at(sizer, idx)?;
            if pair.timestamp > maximum_possible_timestamp {
                return Err(
                    LeafError::Corruption("pair timestamp beyond maximum possible timestamp")
                        .into(),
                );
            }
            if pair.timestamp > minimum {
                batch.push(DumpedEntry {
                    key: pair.key,
                    value: pair.value,
                    timestamp: pair.timestamp,
                });
            }
        }
    }
    tracing::trace!(
        target: "leafnode::dump",
        minimum = minimum.0,
        entries = batch.len(),
        "dumped leaf entries"
    );
    receiver.keys_values(&batch)
}

/// Owned copy of one backfill callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicationEvent {
    /// See [`EntryReceiver::lost_deletions`].
    LostDeletions,
    /// See [`EntryReceiver::deletion`].
    Deletion {
        /// Deleted key.
        key: Vec<u8>,
        /// When it was deleted.
        timestamp: Timestamp,
    },
    /// One entry from [`EntryReceiver::keys_values`].
    Entry {
        /// Key bytes.
        key: Vec<u8>,
        /// Encoded value bytes.
        value: Vec<u8>,
        /// Last modification time.
        timestamp: Timestamp,
    },
}

/// Receiver that records every callback as a [`ReplicationEvent`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventLog {
    /// Events in the order they were received.
    pub events: Vec<ReplicationEvent>,
    /// Number of `keys_values` batches received.
    pub batches: usize,
}

impl EventLog {
    /// True when the stream asked the receiver to drop its range.
    pub fn lost_deletions(&self) -> bool {
        self.events
            .iter()
            .any(|event| matches!(event, ReplicationEvent::LostDeletions))
    }

    /// Deleted keys, newest first.
    pub fn deleted_keys(&self) -> Vec<&[u8]> {
        self.events
            .iter()
            .filter_map(|event| match event {
                ReplicationEvent::Deletion { key, .. } => Some(key.as_slice()),
                _ => None,
            })
            .collect()
    }

    /// Keys of the live entries, in key order.
    pub fn entry_keys(&self) -> Vec<&[u8]> {
        self.events
            .iter()
            .filter_map(|event| match event {
                ReplicationEvent::Entry { key, .. } => Some(key.as_slice()),
                _ => None,
            })
            .collect()
    }
}

impl EntryReceiver for EventLog {
    type Error = LeafError;

    fn lost_deletions(&mut self) -> Result<(), LeafError> {
        self.events.push(ReplicationEvent::LostDeletions);
        Ok(())
    }

    fn deletion(&mut self, key: &[u8], timestamp: Timestamp) -> Result<(), LeafError> {
        self.events.push(ReplicationEvent::Deletion {
            key: key.to_vec(),
            timestamp,
        });
        Ok(())
    }

    fn keys_values(&mut self, entries: &[DumpedEntry<'_>]) -> Result<(), LeafError> {
        self.batches += 1;
        self.events
            .extend(entries.iter().map(|entry| ReplicationEvent::Entry {
                key: entry.key.to_vec(),
                value: entry.value.to_vec(),
                timestamp: entry.timestamp,
            }));
        Ok(())
    }
}
