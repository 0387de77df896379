use std::fmt;
use std::io;

use super::node::Leaf;
use crate::storage::btree::sizer::ValueSizer;

/// Human-readable rendering of a leaf, for debugging.
pub struct LeafDisplay<'a, S: ?Sized, B> {
    sizer: &'a S,
    node: &'a Leaf<B>,
}

impl<'a, S: ValueSizer + ?Sized, B: AsRef<[u8]>> LeafDisplay<'a, S, B> {
    /// Wraps `node` for display.
    pub fn new(sizer: &'a S, node: &'a Leaf<B>) -> Self {
        Self { sizer, node }
    }
}

impl<S: ValueSizer + ?Sized, B: AsRef<[u8]>> fmt::Display for LeafDisplay<'_, S, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.node.header();
        writeln!(
            f,
            "leaf: {} pairs, frontmost {}, history {} records at {}, cutoff {}, newest {}",
            header.num_pairs,
            header.frontmost,
            header.history_count,
            header.history_start,
            header.history_cutoff,
            header.newest
        )?;
        for (idx, pair) in self.node.iter(self.sizer).enumerate() {
            match pair {
                Ok(pair) => writeln!(
                    f,
                    "  [{idx}] ts={} key={} value={}",
                    pair.timestamp,
                    hex::encode(pair.key),
                    hex::encode(pair.value)
                )?,
                Err(err) => return writeln!(f, "  [{idx}] <{err}>"),
            }
        }
        for record in self.node.history() {
            match record {
                Ok(record) => match record.deleted_key {
                    Some(key) => writeln!(
                        f,
                        "  history ts={} delete key={}",
                        record.timestamp,
                        hex::encode(key)
                    )?,
                    None => writeln!(f, "  history ts={} insert", record.timestamp)?,
                },
                Err(err) => return writeln!(f, "  history <{err}>"),
            }
        }
        Ok(())
    }
}

/// Renders `node` into a string.
pub fn strprint_leaf<S, B>(sizer: &S, node: &Leaf<B>) -> String
where
    S: ValueSizer + ?Sized,
    B: AsRef<[u8]>,
{
    LeafDisplay::new(sizer, node).to_string()
}

/// Writes the rendering of `node` to `out`.
pub fn print<W, S, B>(out: &mut W, sizer: &S, node: &Leaf<B>) -> io::Result<()>
where
    W: io::Write + ?Sized,
    S: ValueSizer + ?Sized,
    B: AsRef<[u8]>,
{
    write!(out, "{}", LeafDisplay::new(sizer, node))
}
