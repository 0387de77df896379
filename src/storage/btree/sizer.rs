//! Value encodings understood by the leaf layer.
//!
//! Leaves never interpret value bytes; they ask a [`ValueSizer`] how long the
//! encoded value starting at some offset is and whether it fits in a window.

use crate::primitives::bytes::var;
use crate::types::{BlockSize, LeafError, Result};

/// Policy describing how values are encoded inside a leaf block.
pub trait ValueSizer {
    /// Returns the encoded length of the value stored at the start of `value`.
    fn size(&self, value: &[u8]) -> Result<usize>;

    /// Returns true when the value at the start of `value` is fully contained in
    /// the first `length_available` bytes. Must not read past that window.
    fn fits(&self, value: &[u8], length_available: usize) -> bool;

    /// Largest encoded value this sizer will ever report.
    fn max_possible_size(&self) -> usize;

    /// Size of the blocks the leaves live in.
    fn block_size(&self) -> BlockSize;
}

impl<S: ValueSizer + ?Sized> ValueSizer for &S {
    fn size(&self, value: &[u8]) -> Result<usize> {
        (**self).size(value)
    }

    fn fits(&self, value: &[u8], length_available: usize) -> bool {
        (**self).fits(value, length_available)
    }

    fn max_possible_size(&self) -> usize {
        (**self).max_possible_size()
    }

    fn block_size(&self) -> BlockSize {
        (**self).block_size()
    }
}

/// Values of one fixed width with no length prefix.
#[derive(Clone, Copy, Debug)]
pub struct FixedSizer {
    value_len: usize,
    block_size: BlockSize,
}

impl FixedSizer {
    /// Creates a sizer for `value_len`-byte values.
    pub fn new(value_len: usize, block_size: BlockSize) -> Self {
        Self {
            value_len,
            block_size,
        }
    }
}

impl ValueSizer for FixedSizer {
    fn size(&self, value: &[u8]) -> Result<usize> {
        if value.len() < self.value_len {
            return Err(LeafError::Corruption("fixed value truncated"));
        }
        Ok(self.value_len)
    }

    fn fits(&self, value: &[u8], length_available: usize) -> bool {
        self.value_len <= length_available.min(value.len())
    }

    fn max_possible_size(&self) -> usize {
        self.value_len
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }
}

/// Values carrying a varint length prefix followed by the payload bytes.
#[derive(Clone, Copy, Debug)]
pub struct VarSizer {
    max_value_len: usize,
    block_size: BlockSize,
}

impl VarSizer {
    /// Creates a sizer for payloads of at most `max_value_len` bytes.
    pub fn new(max_value_len: usize, block_size: BlockSize) -> Self {
        Self {
            max_value_len,
            block_size,
        }
    }

    /// Encodes `payload` in this sizer's format.
    pub fn encode(&self, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if payload.len() > self.max_value_len {
            return Err(LeafError::Invalid("value longer than sizer maximum"));
        }
        var::encode_u64(payload.len() as u64, out);
        out.extend_from_slice(payload);
        Ok(())
    }

    /// Convenience wrapper around [`VarSizer::encode`].
    pub fn encoded(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(payload.len() + var::MAX_VARINT_LEN);
        self.encode(payload, &mut out)?;
        Ok(out)
    }

    /// Strips the length prefix from an encoded value.
    pub fn payload<'a>(&self, value: &'a [u8]) -> Result<&'a [u8]> {
        let (len, prefix) = var::try_decode_u64(value)
            .ok_or(LeafError::Corruption("value length prefix truncated"))?;
        let len = usize::try_from(len)
            .map_err(|_| LeafError::Corruption("value length exceeds usize"))?;
        value
            .get(prefix..prefix + len)
            .ok_or(LeafError::Corruption("value payload truncated"))
    }
}

impl ValueSizer for VarSizer {
    fn size(&self, value: &[u8]) -> Result<usize> {
        let (len, prefix) = var::try_decode_u64(value)
            .ok_or(LeafError::Corruption("value length prefix truncated"))?;
        let len = usize::try_from(len)
            .map_err(|_| LeafError::Corruption("value length exceeds usize"))?;
        if len > self.max_value_len {
            return Err(LeafError::Corruption("value longer than sizer maximum"));
        }
        if prefix + len > value.len() {
            return Err(LeafError::Corruption("value payload truncated"));
        }
        Ok(prefix + len)
    }

    fn fits(&self, value: &[u8], length_available: usize) -> bool {
        let window = &value[..length_available.min(value.len())];
        match var::try_decode_u64(window) {
            Some((len, prefix)) => {
                len <= self.max_value_len as u64 && prefix as u64 + len <= window.len() as u64
            }
            None => false,
        }
    }

    fn max_possible_size(&self) -> usize {
        var::encoded_len(self.max_value_len as u64) + self.max_value_len
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }
}

/// Either built-in sizer, as selected by configuration.
#[derive(Clone, Copy, Debug)]
pub enum AnySizer {
    /// Fixed-width values.
    Fixed(FixedSizer),
    /// Length-prefixed values.
    Variable(VarSizer),
}

impl AnySizer {
    /// Encodes a raw payload for storage, adding a length prefix when required.
    pub fn encode_value(&self, payload: &[u8]) -> Result<Vec<u8>> {
        match self {
            AnySizer::Fixed(sizer) => {
                if payload.len() != sizer.value_len {
                    return Err(LeafError::Invalid("value length differs from fixed size"));
                }
                Ok(payload.to_vec())
            }
            AnySizer::Variable(sizer) => sizer.encoded(payload),
        }
    }

    /// Returns the raw payload of a stored value.
    pub fn decode_value<'a>(&self, value: &'a [u8]) -> Result<&'a [u8]> {
        match self {
            AnySizer::Fixed(sizer) => value
                .get(..sizer.value_len)
                .ok_or(LeafError::Corruption("fixed value truncated")),
            AnySizer::Variable(sizer) => sizer.payload(value),
        }
    }
}

impl ValueSizer for AnySizer {
    fn size(&self, value: &[u8]) -> Result<usize> {
        match self {
            AnySizer::Fixed(s) => s.size(value),
            AnySizer::Variable(s) => s.size(value),
        }
    }

    fn fits(&self, value: &[u8], length_available: usize) -> bool {
        match self {
            AnySizer::Fixed(s) => s.fits(value, length_available),
            AnySizer::Variable(s) => s.fits(value, length_available),
        }
    }

    fn max_possible_size(&self) -> usize {
        match self {
            AnySizer::Fixed(s) => s.max_possible_size(),
            AnySizer::Variable(s) => s.max_possible_size(),
        }
    }

    fn block_size(&self) -> BlockSize {
        match self {
            AnySizer::Fixed(s) => s.block_size(),
            AnySizer::Variable(s) => s.block_size(),
        }
    }
}
