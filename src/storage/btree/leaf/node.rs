use std::cmp::Ordering;
use std::ops::Range;

use smallvec::SmallVec;

use super::history::{HistoryImage, Retention};
use super::layout::{
    decode_pair, decode_pair_key, encode_pair, pair_len, pair_offset, set_pair_offset, Header,
    HistoryIter, HistoryRecord, PairRef, HEADER_LEN, PAIR_OFFSET_LEN,
};
use crate::storage::btree::key::MAX_KEY_SIZE;
use crate::storage::btree::sizer::ValueSizer;
use crate::storage::btree::stats::LeafUsage;
use crate::types::{LeafError, Result, Timestamp};

/// A leaf node laid out inside a caller-owned block.
///
/// Read access needs `B: AsRef<[u8]>`; mutation additionally needs
/// `B: AsMut<[u8]>`. The leaf never allocates or frees the block itself.
///
/// Mutations assume the caller checked [`Leaf::is_full`] first. Violating
/// that precondition panics rather than corrupting the block.
#[derive(Clone, Debug)]
pub struct Leaf<B> {
    buf: B,
}

fn check_block_len<S: ValueSizer + ?Sized>(sizer: &S, len: usize) -> Result<()> {
    if len != sizer.block_size().value() {
        return Err(LeafError::Invalid("buffer length differs from block size"));
    }
    Ok(())
}

impl<B: AsRef<[u8]>> Leaf<B> {
    /// Wraps an already initialized leaf block.
    pub fn open<S: ValueSizer + ?Sized>(sizer: &S, buf: B) -> Result<Self> {
        check_block_len(sizer, buf.as_ref().len())?;
        Header::parse(buf.as_ref())?;
        Ok(Self { buf })
    }

    /// Releases the underlying block.
    pub fn into_inner(self) -> B {
        self.buf
    }

    /// Raw block contents.
    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    /// Current header fields.
    pub fn header(&self) -> Header {
        Header::read(self.as_bytes())
    }

    /// Number of live pairs.
    pub fn num_pairs(&self) -> usize {
        self.header().num_pairs as usize
    }

    /// True when the leaf holds no live pairs.
    pub fn is_empty(&self) -> bool {
        self.num_pairs() == 0
    }

    /// Deletions at or before this timestamp may have been forgotten.
    pub fn history_cutoff(&self) -> Timestamp {
        self.header().history_cutoff
    }

    /// Newest timestamp of any insert or remove applied to this node.
    pub fn newest_timestamp(&self) -> Timestamp {
        self.header().newest
    }

    /// History records, newest first.
    pub fn history(&self) -> HistoryIter<'_> {
        HistoryIter::new(self.as_bytes(), &self.header())
    }

    pub(crate) fn checked_offset(&self, header: &Header, idx: usize) -> Result<usize> {
        if idx >= header.num_pairs as usize {
            return Err(LeafError::Invalid("pair index out of range"));
        }
        let offset = pair_offset(self.as_bytes(), idx);
        if offset < header.frontmost as usize || offset >= header.history_start as usize {
            return Err(LeafError::Corruption("pair offset outside pair region"));
        }
        Ok(offset)
    }

    /// Key of the pair at `idx` in sorted order.
    pub fn key_at(&self, idx: usize) -> Result<&[u8]> {
        let header = self.header();
        let offset = self.checked_offset(&header, idx)?;
        let (_, key) = decode_pair_key(self.as_bytes(), offset, header.history_start as usize)?;
        Ok(key)
    }

    /// Timestamp of the pair at `idx` in sorted order.
    pub fn timestamp_at(&self, idx: usize) -> Result<Timestamp> {
        let header = self.header();
        let offset = self.checked_offset(&header, idx)?;
        let (timestamp, _) =
            decode_pair_key(self.as_bytes(), offset, header.history_start as usize)?;
        Ok(timestamp)
    }

    /// Timestamp, key, and value of the pair at `idx` in sorted order.
    pub fn pair_at<S: ValueSizer + ?Sized>(&self, sizer: &S, idx: usize) -> Result<PairRef<'_>> {
        let header = self.header();
        let offset = self.checked_offset(&header, idx)?;
        decode_pair(sizer, self.as_bytes(), offset, header.history_start as usize)
    }

    /// Encoded bytes of the pair at `idx`.
    pub(crate) fn pair_bytes_at<S: ValueSizer + ?Sized>(
        &self,
        sizer: &S,
        idx: usize,
    ) -> Result<&[u8]> {
        let header = self.header();
        let offset = self.checked_offset(&header, idx)?;
        let len = decode_pair(sizer, self.as_bytes(), offset, header.history_start as usize)?
            .encoded_len();
        Ok(&self.as_bytes()[offset..offset + len])
    }

    /// Binary search over the sorted offsets.
    ///
    /// Returns `Ok(Ok(idx))` when `key` is present and `Ok(Err(idx))` with the
    /// insertion point otherwise.
    pub fn search(&self, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
        let mut lo = 0usize;
        let mut hi = self.num_pairs();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key_at(mid)?.cmp(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Index of `key` in the offset array, if present.
    pub fn find_key(&self, key: &[u8]) -> Result<Option<usize>> {
        Ok(self.search(key)?.ok())
    }

    /// Encoded value stored under `key`.
    pub fn lookup<S: ValueSizer + ?Sized>(&self, sizer: &S, key: &[u8]) -> Result<Option<&[u8]>> {
        Ok(self.lookup_entry(sizer, key)?.map(|pair| pair.value))
    }

    /// Full pair stored under `key`, including its timestamp.
    pub fn lookup_entry<S: ValueSizer + ?Sized>(
        &self,
        sizer: &S,
        key: &[u8],
    ) -> Result<Option<PairRef<'_>>> {
        match self.search(key)? {
            Ok(idx) => Ok(Some(self.pair_at(sizer, idx)?)),
            Err(_) => Ok(None),
        }
    }

    /// Returns true when the next operation on `key` might not fit.
    ///
    /// `Some(value)` asks about inserting or overwriting; `None` asks about
    /// removing, which needs room for a deletion record. The answer accounts
    /// for the history records the operation would add, supersede, and evict.
    pub fn is_full<S: ValueSizer + ?Sized>(
        &self,
        sizer: &S,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        if key.len() > MAX_KEY_SIZE {
            return Err(LeafError::Invalid("key longer than MAX_KEY_SIZE"));
        }
        let header = self.header();
        let existing = match self.search(key)? {
            Ok(idx) => Some(self.pair_at(sizer, idx)?.encoded_len()),
            Err(_) => None,
        };
        let mut live = header.live_bytes();
        let record = match value {
            Some(value) => {
                let new_len = pair_len(key.len(), sizer.size(value)?);
                match existing {
                    Some(old_len) => live = live - old_len + new_len,
                    None => live += new_len + PAIR_OFFSET_LEN,
                }
                HistoryRecord::insertion(Timestamp::DISTANT_PAST)
            }
            None => {
                if let Some(old_len) = existing {
                    live -= old_len + PAIR_OFFSET_LEN;
                }
                HistoryRecord::deletion(key, Timestamp::DISTANT_PAST)
            }
        };
        let history = self.history_len_after(&record, key)?;
        Ok(HEADER_LEN + live + history > self.as_bytes().len())
    }

    fn history_len_after(&self, record: &HistoryRecord<'_>, supersede: &[u8]) -> Result<usize> {
        let mut retention = Retention::new(self.as_bytes().len(), self.history_cutoff());
        retention.admit(record);
        for existing in self.history() {
            let existing = existing?;
            if existing.deleted_key == Some(supersede) {
                continue;
            }
            retention.admit(&existing);
        }
        Ok(retention.bytes())
    }

    /// Space accounting snapshot.
    pub fn usage(&self) -> Result<LeafUsage> {
        let header = self.header();
        let mut deletion_records = 0;
        for record in self.history() {
            if record?.is_deletion() {
                deletion_records += 1;
            }
        }
        Ok(LeafUsage {
            block_size: self.as_bytes().len(),
            num_pairs: header.num_pairs as usize,
            offset_bytes: header.num_pairs as usize * PAIR_OFFSET_LEN,
            pair_bytes: header.pair_bytes(),
            history_bytes: header.history_bytes(self.as_bytes().len()),
            history_records: header.history_count as usize,
            deletion_records,
            free_bytes: header.free_bytes(),
        })
    }

    #[cfg(any(debug_assertions, feature = "leaf-debug-validate"))]
    pub(crate) fn debug_validate<S: ValueSizer + ?Sized>(&self, sizer: &S) {
        if let Err(msg) = super::fsck::fsck(sizer, None, None, self, None) {
            panic!("leaf invariant violated: {msg}");
        }
    }

    #[cfg(not(any(debug_assertions, feature = "leaf-debug-validate")))]
    #[inline(always)]
    pub(crate) fn debug_validate<S: ValueSizer + ?Sized>(&self, _sizer: &S) {}
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Leaf<B> {
    /// Lays out an empty leaf in `buf`, discarding its previous contents.
    pub fn init<S: ValueSizer + ?Sized>(sizer: &S, mut buf: B) -> Result<Self> {
        check_block_len(sizer, buf.as_ref().len())?;
        let block = buf.as_mut();
        block.fill(0);
        Header::empty(block.len()).write(block);
        Ok(Self { buf })
    }

    pub(crate) fn block_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    /// Empties the leaf in place, dropping all pairs and history.
    pub(crate) fn reset(&mut self) {
        let block = self.buf.as_mut();
        block.fill(0);
        Header::empty(block.len()).write(block);
    }

    /// Inserts `key` or overwrites its value, stamping the pair with `timestamp`.
    ///
    /// Any deletion record for `key` is dropped from the history since the key
    /// is live again.
    pub fn insert<S: ValueSizer + ?Sized>(
        &mut self,
        sizer: &S,
        key: &[u8],
        value: &[u8],
        timestamp: Timestamp,
    ) -> Result<()> {
        if key.len() > MAX_KEY_SIZE {
            return Err(LeafError::Invalid("key longer than MAX_KEY_SIZE"));
        }
        let value = value
            .get(..sizer.size(value)?)
            .ok_or(LeafError::Invalid("value shorter than its encoded size"))?;
        debug_assert!(
            !self.is_full(sizer, key, Some(value))?,
            "insert into full leaf"
        );
        let new_len = pair_len(key.len(), value.len());
        match self.search(key)? {
            Ok(idx) if self.pair_at(sizer, idx)?.encoded_len() == new_len => {
                self.record_history(HistoryRecord::insertion(timestamp), key)?;
                let offset = self.checked_offset(&self.header(), idx)?;
                encode_pair(&mut self.block_mut()[offset..], timestamp, key, value);
            }
            Ok(idx) => {
                self.remove_pair_at(sizer, idx)?;
                self.record_history(HistoryRecord::insertion(timestamp), key)?;
                self.insert_pair_at(idx, timestamp, key, value);
            }
            Err(idx) => {
                self.record_history(HistoryRecord::insertion(timestamp), key)?;
                self.insert_pair_at(idx, timestamp, key, value);
            }
        }
        self.bump_newest(timestamp);
        self.debug_validate(sizer);
        Ok(())
    }

    /// Removes `key` and records the deletion for replication.
    ///
    /// A deletion record is written even when `key` is absent so replicas
    /// that still hold it are told to drop it.
    pub fn remove<S: ValueSizer + ?Sized>(
        &mut self,
        sizer: &S,
        key: &[u8],
        timestamp: Timestamp,
    ) -> Result<()> {
        if key.len() > MAX_KEY_SIZE {
            return Err(LeafError::Invalid("key longer than MAX_KEY_SIZE"));
        }
        debug_assert!(!self.is_full(sizer, key, None)?, "remove from full leaf");
        if let Ok(idx) = self.search(key)? {
            self.remove_pair_at(sizer, idx)?;
        }
        self.record_history(HistoryRecord::deletion(key, timestamp), key)?;
        self.bump_newest(timestamp);
        self.debug_validate(sizer);
        Ok(())
    }

    /// Drops `key` without recording a deletion. Returns whether it was present.
    pub fn erase_presence<S: ValueSizer + ?Sized>(
        &mut self,
        sizer: &S,
        key: &[u8],
    ) -> Result<bool> {
        match self.search(key)? {
            Ok(idx) => {
                self.remove_pair_at(sizer, idx)?;
                self.debug_validate(sizer);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    fn bump_newest(&mut self, timestamp: Timestamp) {
        let mut header = self.header();
        if timestamp > header.newest {
            header.newest = timestamp;
            header.write(self.buf.as_mut());
        }
    }

    pub(crate) fn set_newest(&mut self, timestamp: Timestamp) {
        let mut header = self.header();
        header.newest = timestamp;
        header.write(self.buf.as_mut());
    }

    fn record_history(&mut self, record: HistoryRecord<'_>, supersede: &[u8]) -> Result<()> {
        let cutoff = self.history_cutoff();
        let mut image = HistoryImage::new(self.as_bytes().len(), cutoff);
        image.offer(&record);
        for existing in self.history() {
            let existing = existing?;
            if existing.deleted_key == Some(supersede) {
                continue;
            }
            image.offer(&existing);
        }
        if image.cutoff() > cutoff {
            tracing::debug!(
                target: "leafnode::history",
                old_cutoff = cutoff.0,
                new_cutoff = image.cutoff().0,
                "evicted deletion history"
            );
        }
        self.install_history(&image);
        Ok(())
    }

    /// Replaces the history log with `image`, sliding the pair region so it
    /// stays flush against the log.
    pub(crate) fn install_history(&mut self, image: &HistoryImage) {
        let mut header = self.header();
        let block = self.buf.as_mut();
        let block_len = block.len();
        let front = header.frontmost as usize;
        let old_start = header.history_start as usize;
        let pair_bytes = old_start - front;
        assert!(
            header.offsets_end() + pair_bytes + image.len() <= block_len,
            "leaf block overflow; check is_full before mutating"
        );
        let new_start = block_len - image.len();
        let new_front = new_start - pair_bytes;
        if new_front != front {
            block.copy_within(front..old_start, new_front);
            for slot in 0..header.num_pairs as usize {
                let offset = pair_offset(block, slot);
                set_pair_offset(block, slot, offset + new_front - front);
            }
            if new_front > front {
                block[front..new_front].fill(0);
            }
        }
        block[new_start..].copy_from_slice(image.as_bytes());
        header.frontmost = new_front as u16;
        header.history_start = new_start as u16;
        header.history_count = image.count();
        header.history_cutoff = image.cutoff();
        header.write(block);
    }

    /// Opens a slot at `idx` for a pair of `len` bytes and returns its offset.
    fn reserve_pair(&mut self, idx: usize, len: usize) -> usize {
        let mut header = self.header();
        let count = header.num_pairs as usize;
        assert!(idx <= count, "pair index out of range");
        let front = header.frontmost as usize;
        assert!(
            header.offsets_end() + PAIR_OFFSET_LEN + len <= front,
            "leaf block overflow; check is_full before mutating"
        );
        let new_front = front - len;
        let offsets_end = header.offsets_end();
        let block = self.buf.as_mut();
        let slot = HEADER_LEN + idx * PAIR_OFFSET_LEN;
        block.copy_within(slot..offsets_end, slot + PAIR_OFFSET_LEN);
        set_pair_offset(block, idx, new_front);
        header.num_pairs += 1;
        header.frontmost = new_front as u16;
        header.write(block);
        new_front
    }

    fn insert_pair_at(&mut self, idx: usize, timestamp: Timestamp, key: &[u8], value: &[u8]) {
        let len = pair_len(key.len(), value.len());
        let offset = self.reserve_pair(idx, len);
        encode_pair(&mut self.buf.as_mut()[offset..], timestamp, key, value);
    }

    /// Inserts already encoded pair bytes at sorted position `idx`.
    pub(crate) fn insert_raw_pair(&mut self, idx: usize, pair: &[u8]) {
        let offset = self.reserve_pair(idx, pair.len());
        self.buf.as_mut()[offset..offset + pair.len()].copy_from_slice(pair);
    }

    /// Deletes the pair at `idx` and closes the gap in the pair region.
    pub(crate) fn remove_pair_at<S: ValueSizer + ?Sized>(
        &mut self,
        sizer: &S,
        idx: usize,
    ) -> Result<()> {
        let mut header = self.header();
        let offset = self.checked_offset(&header, idx)?;
        let len = self.pair_at(sizer, idx)?.encoded_len();
        let count = header.num_pairs as usize;
        let front = header.frontmost as usize;
        let offsets_end = header.offsets_end();
        let block = self.buf.as_mut();
        block.copy_within(front..offset, front + len);
        block[front..front + len].fill(0);
        for slot in 0..count {
            let other = pair_offset(block, slot);
            if other < offset {
                set_pair_offset(block, slot, other + len);
            }
        }
        let slot = HEADER_LEN + idx * PAIR_OFFSET_LEN;
        block.copy_within(slot + PAIR_OFFSET_LEN..offsets_end, slot);
        block[offsets_end - PAIR_OFFSET_LEN..offsets_end].fill(0);
        header.num_pairs -= 1;
        header.frontmost = (front + len) as u16;
        header.write(block);
        Ok(())
    }

    /// Keeps only the pairs whose sorted indices fall in `keep`, repacking them.
    pub(crate) fn retain_pairs<S: ValueSizer + ?Sized>(
        &mut self,
        sizer: &S,
        keep: Range<usize>,
    ) -> Result<()> {
        let mut scratch: SmallVec<[u8; 1024]> = SmallVec::new();
        let mut lens: SmallVec<[usize; 64]> = SmallVec::new();
        for idx in keep {
            let pair = self.pair_bytes_at(sizer, idx)?;
            scratch.extend_from_slice(pair);
            lens.push(pair.len());
        }
        let mut header = self.header();
        let end = header.history_start as usize;
        let new_front = end - scratch.len();
        let block = self.buf.as_mut();
        block[HEADER_LEN..end].fill(0);
        block[new_front..end].copy_from_slice(&scratch);
        let mut cursor = new_front;
        for (slot, len) in lens.iter().enumerate() {
            set_pair_offset(block, slot, cursor);
            cursor += len;
        }
        header.num_pairs = lens.len() as u16;
        header.frontmost = new_front as u16;
        header.write(block);
        Ok(())
    }
}
