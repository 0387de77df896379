//! Structural verification of a leaf block.

use smallvec::SmallVec;

use super::history::Retention;
use super::layout::{decode_pair, pair_offset, Header, HistoryRecord};
use super::node::Leaf;
use crate::storage::btree::sizer::ValueSizer;
use crate::types::{LeafError, Result};

/// Hook for checking value contents while a leaf is verified.
pub trait KeyValueFscker {
    /// Returns a description of what is wrong with `value`, if anything.
    fn fsck_value(&mut self, key: &[u8], value: &[u8]) -> std::result::Result<(), String>;
}

impl<F> KeyValueFscker for F
where
    F: FnMut(&[u8], &[u8]) -> std::result::Result<(), String>,
{
    fn fsck_value(&mut self, key: &[u8], value: &[u8]) -> std::result::Result<(), String> {
        self(key, value)
    }
}

/// Checks every structural invariant of `node`.
///
/// Keys must lie in `[left_inclusive, right_exclusive)` when the bounds are
/// given, matching the separators [`split`](super::split) and
/// [`level`](super::level) hand to the parent. Returns a message naming the
/// first violation found.
pub fn fsck<S, B>(
    sizer: &S,
    left_inclusive: Option<&[u8]>,
    right_exclusive: Option<&[u8]>,
    node: &Leaf<B>,
    mut fscker: Option<&mut dyn KeyValueFscker>,
) -> std::result::Result<(), String>
where
    S: ValueSizer + ?Sized,
    B: AsRef<[u8]>,
{
    let block = node.as_bytes();
    if block.len() != sizer.block_size().value() {
        return Err(format!(
            "block is {} bytes, sizer expects {}",
            block.len(),
            sizer.block_size()
        ));
    }
    let header = Header::parse(block).map_err(|err| err.to_string())?;
    let region_end = header.history_start as usize;

    let mut extents: SmallVec<[(usize, usize); 128]> = SmallVec::new();
    let mut previous: Option<&[u8]> = None;
    for idx in 0..header.num_pairs as usize {
        let offset = pair_offset(block, idx);
        if offset < header.frontmost as usize || offset >= region_end {
            return Err(format!("pair {idx} offset {offset} outside pair region"));
        }
        let pair = decode_pair(sizer, block, offset, region_end)
            .map_err(|err| format!("pair {idx}: {err}"))?;
        if let Some(prev) = previous {
            if prev >= pair.key {
                return Err(format!("pair {idx} key not greater than its predecessor"));
            }
        }
        if let Some(left) = left_inclusive {
            if pair.key < left {
                return Err(format!("pair {idx} key below left bound"));
            }
        }
        if let Some(right) = right_exclusive {
            if pair.key >= right {
                return Err(format!("pair {idx} key at or above right bound"));
            }
        }
        if pair.timestamp > header.newest {
            return Err(format!(
                "pair {idx} timestamp {} newer than node timestamp {}",
                pair.timestamp, header.newest
            ));
        }
        if let Some(fscker) = fscker.as_deref_mut() {
            fscker
                .fsck_value(pair.key, pair.value)
                .map_err(|msg| format!("pair {idx} value: {msg}"))?;
        }
        extents.push((offset, pair.encoded_len()));
        previous = Some(pair.key);
    }

    extents.sort_unstable();
    let mut expected = header.frontmost as usize;
    for (offset, len) in &extents {
        if *offset != expected {
            return Err(format!("pair region has a gap or overlap at offset {offset}"));
        }
        expected += len;
    }
    if expected != region_end {
        return Err(format!(
            "pairs end at {expected} but history starts at {region_end}"
        ));
    }

    check_history(node, &header)
}

fn check_history<B: AsRef<[u8]>>(
    node: &Leaf<B>,
    header: &Header,
) -> std::result::Result<(), String> {
    let block = node.as_bytes();
    let mut retention = Retention::new(block.len(), header.history_cutoff);
    let mut deletions: SmallVec<[&[u8]; 32]> = SmallVec::new();
    let mut consumed = 0;
    for (idx, record) in node.history().enumerate() {
        let record: HistoryRecord<'_> =
            record.map_err(|err| format!("history record {idx}: {err}"))?;
        consumed += record.encoded_len();
        if record.timestamp > header.newest {
            return Err(format!(
                "history record {idx} timestamp {} newer than node timestamp {}",
                record.timestamp, header.newest
            ));
        }
        if !retention.admit(&record) {
            return Err(format!("history record {idx} should have been evicted"));
        }
        if let Some(key) = record.deleted_key {
            if deletions.contains(&key) {
                return Err(format!("history holds two deletions of one key at record {idx}"));
            }
            let live = node.find_key(key).map_err(|err| err.to_string())?;
            if live.is_some() {
                return Err(format!("history record {idx} deletes a live key"));
            }
            deletions.push(key);
        }
    }
    if header.history_start as usize + consumed != block.len() {
        return Err(format!(
            "history records cover {consumed} bytes, region holds {}",
            header.history_bytes(block.len())
        ));
    }
    Ok(())
}

/// [`fsck`] without key bounds or value checks, as a [`Result`].
pub fn validate<S, B>(sizer: &S, node: &Leaf<B>) -> Result<()>
where
    S: ValueSizer + ?Sized,
    B: AsRef<[u8]>,
{
    fsck(sizer, None, None, node, None).map_err(LeafError::Fsck)
}
