use std::cmp::Ordering;
use std::fmt;

use crate::types::{LeafError, Result};

/// Longest key a leaf accepts, in bytes.
pub const MAX_KEY_SIZE: usize = 250;

/// Inline, fixed-capacity copy of a key.
///
/// Used wherever a key has to outlive the block it was read from (split medians,
/// leveling separators) without touching the heap.
#[derive(Clone)]
pub struct KeyBuf {
    len: u8,
    bytes: [u8; MAX_KEY_SIZE],
}

impl KeyBuf {
    /// Copies `key`; panics if it is longer than [`MAX_KEY_SIZE`].
    pub fn new(key: &[u8]) -> Self {
        assert!(
            key.len() <= MAX_KEY_SIZE,
            "key of {} bytes exceeds MAX_KEY_SIZE",
            key.len()
        );
        let mut bytes = [0u8; MAX_KEY_SIZE];
        bytes[..key.len()].copy_from_slice(key);
        Self {
            len: key.len() as u8,
            bytes,
        }
    }

    /// Fallible variant of [`KeyBuf::new`].
    pub fn try_from_slice(key: &[u8]) -> Result<Self> {
        if key.len() > MAX_KEY_SIZE {
            return Err(LeafError::Invalid("key longer than MAX_KEY_SIZE"));
        }
        Ok(Self::new(key))
    }

    /// Empty key, which sorts before every other key.
    pub fn empty() -> Self {
        Self::new(&[])
    }

    /// Returns the key bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Overwrites the contents with `key`.
    pub fn assign(&mut self, key: &[u8]) {
        assert!(key.len() <= MAX_KEY_SIZE, "key exceeds MAX_KEY_SIZE");
        self.bytes[..key.len()].copy_from_slice(key);
        self.len = key.len() as u8;
    }
}

impl Default for KeyBuf {
    fn default() -> Self {
        Self::empty()
    }
}

impl AsRef<[u8]> for KeyBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl PartialEq for KeyBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for KeyBuf {}

impl PartialOrd for KeyBuf {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyBuf {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_slice().cmp(other.as_slice())
    }
}

impl fmt::Debug for KeyBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyBuf({})", hex::encode(self.as_slice()))
    }
}
