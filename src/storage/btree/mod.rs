#![forbid(unsafe_code)]

//! Leaf layer of a replicated B-tree.

/// Leaf node format and operations.
pub mod leaf;

mod key;
mod key_cursor;
mod sizer;
mod stats;

pub use key::{KeyBuf, MAX_KEY_SIZE};
pub(crate) use key_cursor::KeyCursor;
pub use leaf::{
    dump_entries_since_time, fsck, is_mergable, is_underfull, level, max_entry_cost, merge, split,
    strprint_leaf, validate, DumpedEntry, EntryReceiver, EventLog, Leaf, Leveled,
    ReplicationEvent,
};
pub use sizer::{AnySizer, FixedSizer, ValueSizer, VarSizer};
pub use stats::LeafUsage;

#[cfg(test)]
mod tests;
