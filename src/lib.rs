//! Fixed-size B-tree leaf blocks with a bounded modification history.
//!
//! A leaf block packs key/value pairs, their last-modification timestamps, and a
//! short log of recent operations (including deletions) into one buffer so that
//! replicas can be brought up to date incrementally.

#![warn(missing_docs)]

pub mod config;
pub mod primitives;
pub mod storage;
pub mod types;
