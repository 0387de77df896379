#![forbid(unsafe_code)]
//! Shared identifiers, error type, and block sizing used by the leaf layer.

use std::fmt;

/// Replication timestamp attached to every leaf modification.
///
/// Timestamps are handed out by the caller and are only compared, never
/// interpreted; the leaf layer assumes they are non-decreasing per node.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Timestamp that precedes every real operation.
    pub const DISTANT_PAST: Timestamp = Timestamp(0);

    /// Returns the timestamp immediately after `self`.
    pub fn next(self) -> Timestamp {
        Timestamp(self.0.saturating_add(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Timestamp(value)
    }
}

/// Smallest block size a leaf can be laid out in.
pub const MIN_BLOCK_SIZE: u32 = 256;

/// Largest block size; every in-block offset must fit in a `u16`.
pub const MAX_BLOCK_SIZE: u32 = u16::MAX as u32;

/// Validated size of a leaf block in bytes.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Default block size used by the CLI and benches.
    pub const DEFAULT: BlockSize = BlockSize(4096);

    /// Validates `bytes` as a block size.
    pub fn new(bytes: u32) -> Result<Self> {
        if bytes < MIN_BLOCK_SIZE {
            return Err(LeafError::Invalid("block size smaller than minimum"));
        }
        if bytes > MAX_BLOCK_SIZE {
            return Err(LeafError::Invalid("block size larger than u16 offsets allow"));
        }
        Ok(Self(bytes))
    }

    /// Returns the size in bytes.
    pub fn value(self) -> usize {
        self.0 as usize
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error type for the leaf layer.
#[derive(thiserror::Error, Debug)]
pub enum LeafError {
    /// IO failure (CLI and config loading only).
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Bytes inside a block do not decode.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the leaf cannot represent.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A structural check failed; the message names the broken invariant.
    #[error("fsck failed: {0}")]
    Fsck(String),
    /// Configuration could not be parsed or is inconsistent.
    #[error("config: {0}")]
    Config(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, LeafError>;
