#![forbid(unsafe_code)]
//! Fixed-width and varint helpers shared by the leaf layout and value sizers.

pub mod ord {
    //! Big-endian fixed-width integers at explicit offsets.

    use core::convert::TryInto;

    const U16_LEN: usize = core::mem::size_of::<u16>();
    const U64_LEN: usize = core::mem::size_of::<u64>();

    /// Writes `v` big-endian at `dst[off..off + 2]`.
    #[inline]
    pub fn put_u16_be(dst: &mut [u8], off: usize, v: u16) {
        dst[off..off + U16_LEN].copy_from_slice(&v.to_be_bytes());
    }

    /// Reads a big-endian u16 at `src[off..off + 2]`.
    #[inline]
    pub fn get_u16_be(src: &[u8], off: usize) -> u16 {
        let bytes: [u8; U16_LEN] = src[off..off + U16_LEN].try_into().unwrap();
        u16::from_be_bytes(bytes)
    }

    /// Writes `v` big-endian at `dst[off..off + 8]`.
    #[inline]
    pub fn put_u64_be(dst: &mut [u8], off: usize, v: u64) {
        dst[off..off + U64_LEN].copy_from_slice(&v.to_be_bytes());
    }

    /// Reads a big-endian u64 at `src[off..off + 8]`.
    #[inline]
    pub fn get_u64_be(src: &[u8], off: usize) -> u64 {
        let bytes: [u8; U64_LEN] = src[off..off + U64_LEN].try_into().unwrap();
        u64::from_be_bytes(bytes)
    }
}

pub mod var {
    //! Unsigned LEB128-style varints.

    /// Maximum encoded length of a u64 varint.
    pub const MAX_VARINT_LEN: usize = 10;

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            } else {
                out.push(byte | 0x80);
            }
        }
    }

    /// Number of bytes `encode_u64(v)` produces.
    pub fn encoded_len(mut v: u64) -> usize {
        let mut len = 1;
        while v >= 0x80 {
            v >>= 7;
            len += 1;
        }
        len
    }

    /// Decodes a varint from the start of `src`, returning the value and bytes consumed.
    ///
    /// Returns `None` when `src` ends before the varint does or the encoding
    /// overflows 64 bits.
    pub fn try_decode_u64(src: &[u8]) -> Option<(u64, usize)> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for (i, &byte) in src.iter().take(MAX_VARINT_LEN).enumerate() {
            let payload = (byte & 0x7f) as u64;
            if i == MAX_VARINT_LEN - 1 && payload > 1 {
                return None;
            }
            result |= payload << shift;
            if (byte & 0x80) == 0 {
                return Some((result, i + 1));
            }
            shift += 7;
        }
        None
    }
}
