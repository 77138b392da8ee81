//! # Tessera DB Memory
//!
//! In-memory backing store. State lives in an `Arc`-swapped immutable
//! snapshot, so datasets are true point-in-time views and applying a batch
//! is merge-or-nothing by construction.

pub mod store;

pub use store::{snapshot_store, MemoryStore};
