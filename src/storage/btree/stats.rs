use serde::Serialize;

/// Space accounting for one leaf block at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LeafUsage {
    /// Size of the block in bytes.
    pub block_size: usize,
    /// Number of live pairs.
    pub num_pairs: usize,
    /// Bytes used by the pair offset array.
    pub offset_bytes: usize,
    /// Bytes used by encoded pairs.
    pub pair_bytes: usize,
    /// Bytes used by the history log.
    pub history_bytes: usize,
    /// Number of history records.
    pub history_records: usize,
    /// Number of history records that are deletions.
    pub deletion_records: usize,
    /// Unused bytes between the offset array and the pair region.
    pub free_bytes: usize,
}

impl LeafUsage {
    /// Bytes attributable to live entries.
    pub fn live_bytes(&self) -> usize {
        self.offset_bytes + self.pair_bytes
    }

    /// Fraction of the block holding live entries, in `[0, 1]`.
    pub fn fill_ratio(&self) -> f64 {
        if self.block_size == 0 {
            return 0.0;
        }
        self.live_bytes() as f64 / self.block_size as f64
    }

    /// Logs the snapshot at info level.
    pub fn emit_tracing(&self) {
        tracing::info!(
            target: "leafnode::stats",
            block_size = self.block_size,
            num_pairs = self.num_pairs,
            offset_bytes = self.offset_bytes,
            pair_bytes = self.pair_bytes,
            history_bytes = self.history_bytes,
            history_records = self.history_records,
            deletion_records = self.deletion_records,
            free_bytes = self.free_bytes,
            "leaf usage snapshot"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::LeafUsage;

    #[test]
    fn fill_ratio_counts_offsets_and_pairs() {
        let usage = LeafUsage {
            block_size: 1000,
            offset_bytes: 100,
            pair_bytes: 400,
            ..LeafUsage::default()
        };
        assert_eq!(usage.live_bytes(), 500);
        assert!((usage.fill_ratio() - 0.5).abs() < f64::EPSILON);
        assert_eq!(LeafUsage::default().fill_ratio(), 0.0);
    }
}
