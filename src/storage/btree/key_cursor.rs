use crate::types::{LeafError, Result};

/// Bounds-checked reader over a region of a leaf block.
#[derive(Clone, Copy, Debug)]
pub struct KeyCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> KeyCursor<'a> {
    /// Creates a cursor over `buf`, starting at `pos`.
    pub fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    /// Current offset into the underlying buffer.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Reads one byte, failing with `truncated_msg` if the buffer ends.
    pub fn read_u8(&mut self, truncated_msg: &'static str) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or(LeafError::Corruption(truncated_msg))?;
        self.pos += 1;
        Ok(byte)
    }

    /// Reads a big-endian u64, failing with `truncated_msg` if the buffer ends.
    pub fn read_u64(&mut self, truncated_msg: &'static str) -> Result<u64> {
        let bytes = self.take(8, truncated_msg)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(arr))
    }

    /// Takes `len` bytes from the cursor without copying.
    pub fn take(&mut self, len: usize, truncated_msg: &'static str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(LeafError::Corruption("leaf length overflow"))?;
        if end > self.buf.len() {
            return Err(LeafError::Corruption(truncated_msg));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Returns the bytes from the cursor position to the end of the buffer.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }

    /// Advances past `len` bytes already validated by the caller.
    pub fn skip(&mut self, len: usize, truncated_msg: &'static str) -> Result<()> {
        self.take(len, truncated_msg).map(|_| ())
    }
}
