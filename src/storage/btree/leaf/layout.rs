//! Byte layout of a leaf block.
//!
//! ```text
//! 0        4          6          8              10             12              20             28
//! | "leaf" | npairs   | frontmost | history_start | history_count | history_cutoff | newest_tstamp |
//! | pair offsets (u16 × npairs, sorted by key) | free ... | pairs [frontmost, history_start) | history |
//! ```
//!
//! Pairs are `timestamp:u64 | key_len:u8 | key | value` and always tile
//! `[frontmost, history_start)` without gaps. History records are
//! `flags:u8 | timestamp:u64 | [key_len:u8 | key]`, newest first, and tile
//! `[history_start, block_size)`. All integers are big-endian.

use crate::primitives::bytes::ord;
use crate::storage::btree::key::MAX_KEY_SIZE;
use crate::storage::btree::KeyCursor;
use crate::storage::btree::sizer::ValueSizer;
use crate::types::{LeafError, Result, Timestamp};

/// Tag stored in the first bytes of every leaf block.
pub const LEAF_TAG: [u8; 4] = *b"leaf";

/// Length of the fixed leaf header.
pub const HEADER_LEN: usize = 28;

const TAG_OFFSET: usize = 0;
const NUM_PAIRS_OFFSET: usize = 4;
const FRONTMOST_OFFSET: usize = 6;
const HISTORY_START_OFFSET: usize = 8;
const HISTORY_COUNT_OFFSET: usize = 10;
const HISTORY_CUTOFF_OFFSET: usize = 12;
const NEWEST_OFFSET: usize = 20;

/// Width of one entry in the pair offset array.
pub const PAIR_OFFSET_LEN: usize = 2;

/// Bytes a pair spends before its key (`timestamp` + `key_len`).
pub const PAIR_HEADER_LEN: usize = 9;

/// Bytes a history record spends before its optional key (`flags` + `timestamp`).
pub const HISTORY_RECORD_HEADER_LEN: usize = 9;

/// Flag bit marking a history record as a deletion.
pub const HISTORY_FLAG_DELETION: u8 = 0x01;

/// Largest possible history record.
pub const MAX_HISTORY_RECORD_LEN: usize = HISTORY_RECORD_HEADER_LEN + 1 + MAX_KEY_SIZE;

/// Number of most recent operations whose history records are always kept.
pub const MANDATORY_TIMESTAMPS: usize = 5;

/// Deletion records may use `1 / DELETION_RESERVE_FRACTION` of the usable block.
pub const DELETION_RESERVE_FRACTION: usize = 10;

/// Bytes available to the offset array, pairs, and history.
pub fn usable_bytes(block_size: usize) -> usize {
    block_size.saturating_sub(HEADER_LEN)
}

/// Byte budget for deletion records in a block of `block_size` bytes.
pub fn deletion_reserve(block_size: usize) -> usize {
    usable_bytes(block_size) / DELETION_RESERVE_FRACTION
}

/// Encoded size of a pair with the given key and value lengths.
pub fn pair_len(key_len: usize, value_len: usize) -> usize {
    PAIR_HEADER_LEN + key_len + value_len
}

/// Decoded leaf header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// Number of live pairs.
    pub num_pairs: u16,
    /// Lowest byte of the pair region.
    pub frontmost: u16,
    /// First byte of the history log.
    pub history_start: u16,
    /// Number of records in the history log.
    pub history_count: u16,
    /// History is only complete for operations strictly after this timestamp.
    pub history_cutoff: Timestamp,
    /// Newest timestamp of any operation applied to this node.
    pub newest: Timestamp,
}

impl Header {
    /// Header of an empty leaf in a block of `block_size` bytes.
    pub fn empty(block_size: usize) -> Self {
        Self {
            num_pairs: 0,
            frontmost: block_size as u16,
            history_start: block_size as u16,
            history_count: 0,
            history_cutoff: Timestamp::DISTANT_PAST,
            newest: Timestamp::DISTANT_PAST,
        }
    }

    /// Decodes and bounds-checks the header at the start of `block`.
    pub fn parse(block: &[u8]) -> Result<Self> {
        if block.len() < HEADER_LEN {
            return Err(LeafError::Corruption("block shorter than leaf header"));
        }
        if block[TAG_OFFSET..TAG_OFFSET + LEAF_TAG.len()] != LEAF_TAG {
            return Err(LeafError::Corruption("missing leaf tag"));
        }
        let header = Self::read(block);
        if header.offsets_end() > header.frontmost as usize {
            return Err(LeafError::Corruption("pair offsets overlap pair region"));
        }
        if header.frontmost > header.history_start {
            return Err(LeafError::Corruption("pair region extends past history"));
        }
        if header.history_start as usize > block.len() {
            return Err(LeafError::Corruption("history start beyond block"));
        }
        Ok(header)
    }

    /// Reads the header fields without validating them.
    pub(crate) fn read(block: &[u8]) -> Self {
        Self {
            num_pairs: ord::get_u16_be(block, NUM_PAIRS_OFFSET),
            frontmost: ord::get_u16_be(block, FRONTMOST_OFFSET),
            history_start: ord::get_u16_be(block, HISTORY_START_OFFSET),
            history_count: ord::get_u16_be(block, HISTORY_COUNT_OFFSET),
            history_cutoff: Timestamp(ord::get_u64_be(block, HISTORY_CUTOFF_OFFSET)),
            newest: Timestamp(ord::get_u64_be(block, NEWEST_OFFSET)),
        }
    }

    /// Writes the tag and all header fields into `block`.
    pub fn write(&self, block: &mut [u8]) {
        block[TAG_OFFSET..TAG_OFFSET + LEAF_TAG.len()].copy_from_slice(&LEAF_TAG);
        ord::put_u16_be(block, NUM_PAIRS_OFFSET, self.num_pairs);
        ord::put_u16_be(block, FRONTMOST_OFFSET, self.frontmost);
        ord::put_u16_be(block, HISTORY_START_OFFSET, self.history_start);
        ord::put_u16_be(block, HISTORY_COUNT_OFFSET, self.history_count);
        ord::put_u64_be(block, HISTORY_CUTOFF_OFFSET, self.history_cutoff.0);
        ord::put_u64_be(block, NEWEST_OFFSET, self.newest.0);
    }

    /// First byte after the pair offset array.
    pub fn offsets_end(&self) -> usize {
        HEADER_LEN + self.num_pairs as usize * PAIR_OFFSET_LEN
    }

    /// Unused bytes between the offset array and the pair region.
    pub fn free_bytes(&self) -> usize {
        (self.frontmost as usize).saturating_sub(self.offsets_end())
    }

    /// Bytes occupied by encoded pairs.
    pub fn pair_bytes(&self) -> usize {
        (self.history_start as usize).saturating_sub(self.frontmost as usize)
    }

    /// Bytes attributable to live entries: offsets plus pairs.
    pub fn live_bytes(&self) -> usize {
        self.num_pairs as usize * PAIR_OFFSET_LEN + self.pair_bytes()
    }

    /// Bytes occupied by the history log in a block of `block_len` bytes.
    pub fn history_bytes(&self, block_len: usize) -> usize {
        block_len.saturating_sub(self.history_start as usize)
    }
}

/// Returns the offset of pair `idx` from the offset array.
pub fn pair_offset(block: &[u8], idx: usize) -> usize {
    ord::get_u16_be(block, HEADER_LEN + idx * PAIR_OFFSET_LEN) as usize
}

/// Overwrites the offset array entry for pair `idx`.
pub fn set_pair_offset(block: &mut [u8], idx: usize, offset: usize) {
    debug_assert!(offset <= u16::MAX as usize);
    ord::put_u16_be(block, HEADER_LEN + idx * PAIR_OFFSET_LEN, offset as u16);
}

/// Borrowed view of one live pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PairRef<'a> {
    /// Timestamp of the last modification.
    pub timestamp: Timestamp,
    /// Key bytes.
    pub key: &'a [u8],
    /// Encoded value bytes (as understood by the sizer).
    pub value: &'a [u8],
}

impl PairRef<'_> {
    /// Bytes this pair occupies in the pair region.
    pub fn encoded_len(&self) -> usize {
        pair_len(self.key.len(), self.value.len())
    }
}

/// Decodes the timestamp and key of the pair at `offset` without a sizer.
pub fn decode_pair_key(block: &[u8], offset: usize, limit: usize) -> Result<(Timestamp, &[u8])> {
    let region = block
        .get(..limit)
        .ok_or(LeafError::Corruption("pair region beyond block"))?;
    let mut cursor = KeyCursor::at(region, offset);
    let timestamp = Timestamp(cursor.read_u64("pair timestamp truncated")?);
    let key_len = cursor.read_u8("pair key length truncated")? as usize;
    if key_len > MAX_KEY_SIZE {
        return Err(LeafError::Corruption("pair key longer than MAX_KEY_SIZE"));
    }
    let key = cursor.take(key_len, "pair key truncated")?;
    Ok((timestamp, key))
}

/// Decodes the pair at `offset`; the pair must end at or before `limit`.
pub fn decode_pair<'a, S: ValueSizer + ?Sized>(
    sizer: &S,
    block: &'a [u8],
    offset: usize,
    limit: usize,
) -> Result<PairRef<'a>> {
    let (timestamp, key) = decode_pair_key(block, offset, limit)?;
    let value_start = offset + PAIR_HEADER_LEN + key.len();
    let rest = &block[value_start..limit];
    if !sizer.fits(rest, rest.len()) {
        return Err(LeafError::Corruption("pair value overruns pair region"));
    }
    let value_len = sizer.size(rest)?;
    Ok(PairRef {
        timestamp,
        key,
        value: &rest[..value_len],
    })
}

/// Encodes a pair into the start of `dst`, returning the bytes written.
pub fn encode_pair(dst: &mut [u8], timestamp: Timestamp, key: &[u8], value: &[u8]) -> usize {
    debug_assert!(key.len() <= MAX_KEY_SIZE);
    let len = pair_len(key.len(), value.len());
    ord::put_u64_be(dst, 0, timestamp.0);
    dst[8] = key.len() as u8;
    dst[PAIR_HEADER_LEN..PAIR_HEADER_LEN + key.len()].copy_from_slice(key);
    dst[PAIR_HEADER_LEN + key.len()..len].copy_from_slice(value);
    len
}

/// One entry of the history log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryRecord<'a> {
    /// When the operation happened.
    pub timestamp: Timestamp,
    /// Key removed by the operation; `None` for insertions and overwrites.
    pub deleted_key: Option<&'a [u8]>,
}

impl<'a> HistoryRecord<'a> {
    /// Record of an insertion or overwrite.
    pub fn insertion(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            deleted_key: None,
        }
    }

    /// Record of `key` being deleted.
    pub fn deletion(key: &'a [u8], timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            deleted_key: Some(key),
        }
    }

    /// True for deletion records.
    pub fn is_deletion(&self) -> bool {
        self.deleted_key.is_some()
    }

    /// Encoded size of the record.
    pub fn encoded_len(&self) -> usize {
        HISTORY_RECORD_HEADER_LEN + self.deleted_key.map_or(0, |key| 1 + key.len())
    }

    /// Appends the encoded record to `out`.
    pub fn encode_into<E: Extend<u8>>(&self, out: &mut E) {
        let flags = if self.is_deletion() {
            HISTORY_FLAG_DELETION
        } else {
            0
        };
        out.extend(std::iter::once(flags));
        out.extend(self.timestamp.0.to_be_bytes());
        if let Some(key) = self.deleted_key {
            out.extend(std::iter::once(key.len() as u8));
            out.extend(key.iter().copied());
        }
    }
}

/// Decodes the history record at `offset`, returning it and its encoded length.
pub fn decode_history_record(block: &[u8], offset: usize) -> Result<(HistoryRecord<'_>, usize)> {
    let mut cursor = KeyCursor::at(block, offset);
    let flags = cursor.read_u8("history flags truncated")?;
    if flags & !HISTORY_FLAG_DELETION != 0 {
        return Err(LeafError::Corruption("unknown history record flags"));
    }
    let timestamp = Timestamp(cursor.read_u64("history timestamp truncated")?);
    let deleted_key = if flags & HISTORY_FLAG_DELETION != 0 {
        let key_len = cursor.read_u8("history key length truncated")? as usize;
        if key_len > MAX_KEY_SIZE {
            return Err(LeafError::Corruption("history key longer than MAX_KEY_SIZE"));
        }
        Some(cursor.take(key_len, "history key truncated")?)
    } else {
        None
    };
    Ok((
        HistoryRecord {
            timestamp,
            deleted_key,
        },
        cursor.pos() - offset,
    ))
}

/// Iterator over the history log, newest record first.
#[derive(Clone, Debug)]
pub struct HistoryIter<'a> {
    block: &'a [u8],
    pos: usize,
    remaining: u16,
}

impl<'a> HistoryIter<'a> {
    pub(crate) fn new(block: &'a [u8], header: &Header) -> Self {
        Self {
            block,
            pos: header.history_start as usize,
            remaining: header.history_count,
        }
    }
}

impl<'a> Iterator for HistoryIter<'a> {
    type Item = Result<HistoryRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match decode_history_record(self.block, self.pos) {
            Ok((record, len)) => {
                self.pos += len;
                self.remaining -= 1;
                Some(Ok(record))
            }
            Err(err) => {
                self.remaining = 0;
                Some(Err(err))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}
