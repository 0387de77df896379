use std::iter::{FusedIterator, Rev};

use super::layout::PairRef;
use super::node::Leaf;
use crate::storage::btree::sizer::ValueSizer;
use crate::types::Result;

/// Iterator over a leaf's pairs in key order.
///
/// Double-ended, so `.rev()` walks from the largest key down. A decode error
/// is yielded once and ends the iteration.
pub struct Iter<'a, S: ?Sized, B> {
    node: &'a Leaf<B>,
    sizer: &'a S,
    front: usize,
    back: usize,
}

impl<'a, S: ValueSizer + ?Sized, B: AsRef<[u8]>> Iter<'a, S, B> {
    fn new(node: &'a Leaf<B>, sizer: &'a S, front: usize, back: usize) -> Self {
        Self {
            node,
            sizer,
            front,
            back,
        }
    }

    fn yield_at(&mut self, idx: usize) -> Result<PairRef<'a>> {
        let pair = self.node.pair_at(self.sizer, idx);
        if pair.is_err() {
            self.front = self.back;
        }
        pair
    }
}

impl<'a, S: ValueSizer + ?Sized, B: AsRef<[u8]>> Iterator for Iter<'a, S, B> {
    type Item = Result<PairRef<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        let idx = self.front;
        self.front += 1;
        Some(self.yield_at(idx))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.back - self.front;
        (remaining, Some(remaining))
    }
}

impl<S: ValueSizer + ?Sized, B: AsRef<[u8]>> DoubleEndedIterator for Iter<'_, S, B> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        let idx = self.back;
        Some(self.yield_at(idx))
    }
}

impl<S: ValueSizer + ?Sized, B: AsRef<[u8]>> ExactSizeIterator for Iter<'_, S, B> {}

impl<S: ValueSizer + ?Sized, B: AsRef<[u8]>> FusedIterator for Iter<'_, S, B> {}

impl<B: AsRef<[u8]>> Leaf<B> {
    /// All pairs in ascending key order.
    pub fn iter<'a, S: ValueSizer + ?Sized>(&'a self, sizer: &'a S) -> Iter<'a, S, B> {
        Iter::new(self, sizer, 0, self.num_pairs())
    }

    /// Pairs with keys `>= key`, ascending.
    pub fn inclusive_lower_bound<'a, S: ValueSizer + ?Sized>(
        &'a self,
        sizer: &'a S,
        key: &[u8],
    ) -> Result<Iter<'a, S, B>> {
        let start = match self.search(key)? {
            Ok(idx) | Err(idx) => idx,
        };
        Ok(Iter::new(self, sizer, start, self.num_pairs()))
    }

    /// Pairs with keys `<= key`, descending.
    pub fn inclusive_upper_bound<'a, S: ValueSizer + ?Sized>(
        &'a self,
        sizer: &'a S,
        key: &[u8],
    ) -> Result<Rev<Iter<'a, S, B>>> {
        let end = match self.search(key)? {
            Ok(idx) => idx + 1,
            Err(idx) => idx,
        };
        Ok(Iter::new(self, sizer, 0, end).rev())
    }
}
