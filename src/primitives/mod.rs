//! Low-level primitives for building the leaf layer.

/// Byte-level utilities and encoding/decoding.
pub mod bytes;
