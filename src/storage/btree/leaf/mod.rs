//! Leaf nodes: sorted pairs plus a bounded modification history in one block.
//!
//! A node is created with [`Leaf::init`] and reopened with [`Leaf::open`].
//! Callers check [`Leaf::is_full`] before every insert or remove, and split
//! a full node with [`split`] before retrying. Underfull nodes are rebalanced
//! with [`level`] or folded into a neighbour with [`merge`].

mod balance;
mod dump;
mod fsck;
mod history;
mod iter;
pub mod layout;
mod node;
mod print;

pub use balance::{is_mergable, is_underfull, level, max_entry_cost, merge, split, Leveled};
pub use dump::{dump_entries_since_time, DumpedEntry, EntryReceiver, EventLog, ReplicationEvent};
pub use fsck::{fsck, validate, KeyValueFscker};
pub use iter::Iter;
pub use layout::{
    HistoryRecord, PairRef, DELETION_RESERVE_FRACTION, HEADER_LEN, MANDATORY_TIMESTAMPS,
};
pub use node::Leaf;
pub use print::{print, strprint_leaf, LeafDisplay};
