//! Structural operations between sibling leaves: split, merge, and level.
//!
//! Each operation rebuilds the history of the nodes it touches from the
//! deletion records routed to them by key and from the timestamps of the
//! entries they end up holding. Cutoffs only ever move forward.

use std::cmp::Ordering;
use std::ops::Range;

use smallvec::SmallVec;

use super::history::{rebuild, HistoryImage, NewestTimestamps};
use super::layout::{
    pair_len, usable_bytes, HistoryRecord, HEADER_LEN, HISTORY_RECORD_HEADER_LEN,
    PAIR_OFFSET_LEN,
};
use super::node::Leaf;
use crate::storage::btree::key::{KeyBuf, MAX_KEY_SIZE};
use crate::storage::btree::sizer::ValueSizer;
use crate::types::Result;

type Deletions<'a> = SmallVec<[HistoryRecord<'a>; 32]>;

/// Bytes the largest possible entry needs: offset, pair, and its history record.
pub fn max_entry_cost<S: ValueSizer + ?Sized>(sizer: &S) -> usize {
    PAIR_OFFSET_LEN
        + pair_len(MAX_KEY_SIZE, sizer.max_possible_size())
        + HISTORY_RECORD_HEADER_LEN
}

/// True when live entries use less than a quarter of the usable block.
pub fn is_underfull<S: ValueSizer + ?Sized, B: AsRef<[u8]>>(sizer: &S, node: &Leaf<B>) -> bool {
    node.header().live_bytes() < usable_bytes(sizer.block_size().value()) / 4
}

/// True when both nodes' entries and merged history fit in one block with
/// room left for one more maximum-size entry.
pub fn is_mergable<S, B1, B2>(sizer: &S, node: &Leaf<B1>, sibling: &Leaf<B2>) -> Result<bool>
where
    S: ValueSizer + ?Sized,
    B1: AsRef<[u8]>,
    B2: AsRef<[u8]>,
{
    let block = sizer.block_size().value();
    let live = node.header().live_bytes() + sibling.header().live_bytes();
    let history = merged_history(block, node, sibling)?;
    Ok(HEADER_LEN + live + history.len() + max_entry_cost(sizer) <= block)
}

fn collect_deletions<'a, B, F>(
    node: &'a Leaf<B>,
    mut route: F,
    out: &mut Deletions<'a>,
) -> Result<()>
where
    B: AsRef<[u8]>,
    F: FnMut(&[u8]) -> Result<bool>,
{
    for record in node.history() {
        let record = record?;
        if let Some(key) = record.deleted_key {
            if route(key)? {
                out.push(record);
            }
        }
    }
    Ok(())
}

fn observe_entries<B: AsRef<[u8]>>(
    node: &Leaf<B>,
    range: Range<usize>,
    newest: &mut NewestTimestamps,
) -> Result<()> {
    for idx in range {
        newest.observe(node.timestamp_at(idx)?);
    }
    Ok(())
}

fn merged_history<B1: AsRef<[u8]>, B2: AsRef<[u8]>>(
    block: usize,
    a: &Leaf<B1>,
    b: &Leaf<B2>,
) -> Result<HistoryImage> {
    let mut deletions = Deletions::new();
    collect_deletions(a, |key| Ok(b.find_key(key)?.is_none()), &mut deletions)?;
    collect_deletions(b, |key| Ok(a.find_key(key)?.is_none()), &mut deletions)?;
    let mut newest = NewestTimestamps::default();
    observe_entries(a, 0..a.num_pairs(), &mut newest)?;
    observe_entries(b, 0..b.num_pairs(), &mut newest)?;
    let cutoff = a.history_cutoff().max(b.history_cutoff());
    Ok(rebuild(block, cutoff, &mut deletions, &newest))
}

/// Moves the upper half of `node` (by bytes, history included) into the empty
/// `sibling` and returns the first key of `sibling`.
///
/// Afterwards every key in `node` is below the returned median and every key
/// in `sibling` is at or above it. `node` must hold at least two entries.
pub fn split<S, B1, B2>(sizer: &S, node: &mut Leaf<B1>, sibling: &mut Leaf<B2>) -> Result<KeyBuf>
where
    S: ValueSizer + ?Sized,
    B1: AsRef<[u8]> + AsMut<[u8]>,
    B2: AsRef<[u8]> + AsMut<[u8]>,
{
    let count = node.num_pairs();
    assert!(count >= 2, "split needs at least two pairs");
    let block = sizer.block_size().value();

    let mut costs: SmallVec<[usize; 128]> = SmallVec::with_capacity(count);
    for idx in 0..count {
        costs.push(node.pair_bytes_at(sizer, idx)?.len() + PAIR_OFFSET_LEN);
    }
    let mut deletions = Deletions::new();
    collect_deletions(node, |_| Ok(true), &mut deletions)?;
    let total: usize = costs.iter().sum();
    let deletion_total: usize = deletions.iter().map(HistoryRecord::encoded_len).sum();

    let mut best = (usize::MAX, 1);
    let mut prefix = 0;
    for split_at in 1..count {
        prefix += costs[split_at - 1];
        let boundary = node.key_at(split_at)?;
        let low_deletions: usize = deletions
            .iter()
            .filter(|record| record.deleted_key.is_some_and(|key| key < boundary))
            .map(HistoryRecord::encoded_len)
            .sum();
        let low = prefix + low_deletions;
        let high = total - prefix + deletion_total - low_deletions;
        let worst = low.max(high);
        if worst < best.0 {
            best = (worst, split_at);
        }
    }
    let split_at = best.1;
    let median = KeyBuf::new(node.key_at(split_at)?);

    let cutoff = node.history_cutoff();
    let newest = node.newest_timestamp();
    let (low_image, high_image) = {
        let (mut low, mut high): (Deletions<'_>, Deletions<'_>) = deletions
            .into_iter()
            .partition(|record| record.deleted_key.is_some_and(|key| key < median.as_slice()));
        let mut low_entries = NewestTimestamps::default();
        observe_entries(node, 0..split_at, &mut low_entries)?;
        let mut high_entries = NewestTimestamps::default();
        observe_entries(node, split_at..count, &mut high_entries)?;
        (
            rebuild(block, cutoff, &mut low, &low_entries),
            rebuild(block, cutoff, &mut high, &high_entries),
        )
    };

    sibling.reset();
    sibling.install_history(&high_image);
    for idx in split_at..count {
        sibling.insert_raw_pair(idx - split_at, node.pair_bytes_at(sizer, idx)?);
    }
    sibling.set_newest(newest);
    node.retain_pairs(sizer, 0..split_at)?;
    node.install_history(&low_image);

    tracing::trace!(
        target: "leafnode::split",
        left_pairs = split_at,
        right_pairs = count - split_at,
        median = %hex::encode(median.as_slice()),
        "split leaf"
    );
    node.debug_validate(sizer);
    sibling.debug_validate(sizer);
    Ok(median)
}

/// Moves every entry of `left` into `right`, leaving `left` empty.
///
/// All keys of `left` must sort before those of `right`, and the pair must be
/// [`is_mergable`]; both are asserted.
pub fn merge<S, B1, B2>(sizer: &S, left: &mut Leaf<B1>, right: &mut Leaf<B2>) -> Result<()>
where
    S: ValueSizer + ?Sized,
    B1: AsRef<[u8]> + AsMut<[u8]>,
    B2: AsRef<[u8]> + AsMut<[u8]>,
{
    assert!(
        is_mergable(sizer, left, right)?,
        "merge of leaves that do not fit in one block"
    );
    let left_count = left.num_pairs();
    if left_count > 0 && !right.is_empty() {
        assert!(
            left.key_at(left_count - 1)? < right.key_at(0)?,
            "merge of overlapping leaves"
        );
    }
    let image = merged_history(sizer.block_size().value(), left, right)?;
    let newest = left.newest_timestamp().max(right.newest_timestamp());

    right.install_history(&image);
    for idx in 0..left_count {
        right.insert_raw_pair(idx, left.pair_bytes_at(sizer, idx)?);
    }
    right.set_newest(newest);
    left.reset();

    tracing::trace!(
        target: "leafnode::merge",
        moved_pairs = left_count,
        merged_pairs = right.num_pairs(),
        "merged leaves"
    );
    right.debug_validate(sizer);
    Ok(())
}

/// Result of a successful [`level`].
#[derive(Clone, Debug)]
pub struct Leveled {
    /// New separator between the pair: the first key of whichever node is on the right.
    pub replacement_key: KeyBuf,
    /// Indexes in the leveled node of the entries that moved into it.
    pub moved: Range<usize>,
}

impl Leveled {
    /// Encoded values that moved into `node`, in key order.
    ///
    /// Only meaningful until `node` is mutated again.
    pub fn moved_values<'a, S, B>(
        &self,
        sizer: &S,
        node: &'a Leaf<B>,
    ) -> Result<SmallVec<[&'a [u8]; 16]>>
    where
        S: ValueSizer + ?Sized,
        B: AsRef<[u8]>,
    {
        let mut values = SmallVec::new();
        for idx in self.moved.clone() {
            values.push(node.pair_at(sizer, idx)?.value);
        }
        Ok(values)
    }
}

/// Moves entries from `sibling` into the underfull `node` until the two hold
/// roughly equal live bytes.
///
/// `nodecmp` is `node`'s position relative to `sibling`: `Less` when `node`
/// is the left neighbour. Returns `None`, leaving both untouched, when no
/// entry can move or when leveling would leave `sibling` underfull.
pub fn level<S, B1, B2>(
    sizer: &S,
    nodecmp: Ordering,
    node: &mut Leaf<B1>,
    sibling: &mut Leaf<B2>,
) -> Result<Option<Leveled>>
where
    S: ValueSizer + ?Sized,
    B1: AsRef<[u8]> + AsMut<[u8]>,
    B2: AsRef<[u8]> + AsMut<[u8]>,
{
    assert_ne!(nodecmp, Ordering::Equal, "node cannot be its own sibling");
    let node_is_left = nodecmp == Ordering::Less;
    let block = sizer.block_size().value();
    let node_count = node.num_pairs();
    let sibling_count = sibling.num_pairs();

    let mut node_live = node.header().live_bytes();
    let mut sibling_live = sibling.header().live_bytes();
    let mut moved = 0;
    while moved + 1 < sibling_count {
        let idx = if node_is_left {
            moved
        } else {
            sibling_count - 1 - moved
        };
        let cost = sibling.pair_bytes_at(sizer, idx)?.len() + PAIR_OFFSET_LEN;
        if node_live + cost > sibling_live - cost {
            break;
        }
        node_live += cost;
        sibling_live -= cost;
        moved += 1;
    }
    if moved == 0 || sibling_live < usable_bytes(block) / 4 {
        return Ok(None);
    }

    let (moving, staying) = if node_is_left {
        (0..moved, moved..sibling_count)
    } else {
        (sibling_count - moved..sibling_count, 0..sibling_count - moved)
    };
    // First key of the right-hand node once the entries have moved.
    let boundary = KeyBuf::new(sibling.key_at(if node_is_left { moved } else { moving.start })?);
    let routes_to_node = |key: &[u8]| {
        if node_is_left {
            key < boundary.as_slice()
        } else {
            key >= boundary.as_slice()
        }
    };

    let node_cutoff = node.history_cutoff().max(sibling.history_cutoff());
    let node_newest = node.newest_timestamp().max(sibling.newest_timestamp());
    let (node_image, sibling_image) = {
        let mut node_deletions = Deletions::new();
        collect_deletions(node, |key| Ok(sibling.find_key(key)?.is_none()), &mut node_deletions)?;
        collect_deletions(sibling, |key| Ok(routes_to_node(key)), &mut node_deletions)?;
        let mut node_entries = NewestTimestamps::default();
        observe_entries(node, 0..node_count, &mut node_entries)?;
        observe_entries(sibling, moving.clone(), &mut node_entries)?;

        let mut sibling_deletions = Deletions::new();
        collect_deletions(sibling, |key| Ok(!routes_to_node(key)), &mut sibling_deletions)?;
        let mut sibling_entries = NewestTimestamps::default();
        observe_entries(sibling, staying.clone(), &mut sibling_entries)?;
        (
            rebuild(block, node_cutoff, &mut node_deletions, &node_entries),
            rebuild(
                block,
                sibling.history_cutoff(),
                &mut sibling_deletions,
                &sibling_entries,
            ),
        )
    };
    if HEADER_LEN + node_live + node_image.len() > block
        || HEADER_LEN + sibling_live + sibling_image.len() > block
    {
        return Ok(None);
    }

    node.install_history(&node_image);
    let insert_at = if node_is_left { node_count } else { 0 };
    for (offset, idx) in moving.clone().enumerate() {
        node.insert_raw_pair(insert_at + offset, sibling.pair_bytes_at(sizer, idx)?);
    }
    node.set_newest(node_newest);
    sibling.retain_pairs(sizer, staying)?;
    sibling.install_history(&sibling_image);

    tracing::trace!(
        target: "leafnode::level",
        moved_pairs = moved,
        node_pairs = node.num_pairs(),
        sibling_pairs = sibling.num_pairs(),
        "leveled leaves"
    );
    node.debug_validate(sizer);
    sibling.debug_validate(sizer);

    Ok(Some(Leveled {
        replacement_key: boundary,
        moved: insert_at..insert_at + moved,
    }))
}
