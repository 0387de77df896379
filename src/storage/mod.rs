//! Block-level storage structures.

/// B-tree leaf blocks and the value sizers they are parameterized by.
pub mod btree;
