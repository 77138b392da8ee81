//! # Tessera DB Store
//!
//! Branchable, transactional statement storage.
//!
//! A flat backing store (anything implementing [`BackingStore`]) is lifted
//! into a tree of [`Source`]/[`Branch`] instances. Writers stage into
//! [`Changeset`]s through [`Sink`]s; readers get layered [`Dataset`] views
//! that apply unpublished changesets over a pinned snapshot. Flushing moves
//! state down the tree one level at a time, atomically per level.
//!
//! ## Design Principles
//!
//! 1. **Copy-on-write layering**: a branch never mutates its backing source
//!    until `flush`; reads compose the backing snapshot with the stack of
//!    merged changesets at call time
//! 2. **One critical section per branch**: conflict checking and merging are
//!    serialized by a single per-branch lock, held across a prepared sink's
//!    prepare-to-close window, so the check-then-merge sequence is sound
//! 3. **Scoped resources**: every dataset, sink, and statement sequence is
//!    closed explicitly; wrappers own what they wrap and close it with
//!    themselves, with drop as the backstop
//!
//! ## Crate Layout
//!
//! - [`changeset`]: the pending delta of one write handle
//! - [`dataset`]: layered and observing read views
//! - [`branch`]: the buffering branch and its merge/flush machinery
//! - [`source`]: the `Source`/`Branch`/`Sink`/`Dataset` contracts and the
//!   backing-store adapter
//! - [`union`]: two branches read as one
//! - [`store`]: the explicit+inferred store facade

pub mod branch;
pub mod changeset;
pub mod dataset;
pub mod error;
pub mod isolation;
pub mod iter;
pub mod source;
pub mod store;
pub mod union;

pub use branch::SourceBranch;
pub use changeset::{ChangeBatch, Changeset, NamespaceOverride};
pub use dataset::{DerivedDataset, ObservingDataset};
pub use error::{Result, StoreError};
pub use isolation::IsolationLevel;
pub use iter::{collect_all, BoxIter, ClosableIter};
pub use source::{BackingSource, BackingStore, Branch, Dataset, DelegatingBranch, Sink, Source};
pub use store::{EvaluationStatistics, SnapshotStore, Store};
pub use union::{UnionBranch, UnionDataset};
