//! Transaction isolation levels
//!
//! Levels are ordered; each level implies the guarantees of every weaker
//! level. When a backing store cannot honor a requested level, the request is
//! silently upgraded to the nearest stronger supported level; only when no
//! stronger level is supported does acquisition fail.

use crate::error::{Result, StoreError};
use std::fmt;

/// Isolation level for a dataset/sink pair, weakest to strongest
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub enum IsolationLevel {
    /// No guarantees
    None,
    /// May read uncommitted state of concurrent writers
    ReadUncommitted,
    /// Reads only committed state, re-read may differ
    #[default]
    ReadCommitted,
    /// Each read sees one committed state, but not pinned across reads
    SnapshotRead,
    /// All reads through one dataset see one pinned state
    Snapshot,
    /// Snapshot plus observed-read conflict detection at prepare time
    Serializable,
}

impl IsolationLevel {
    /// All levels, weakest first
    pub const ALL: [IsolationLevel; 6] = [
        IsolationLevel::None,
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::SnapshotRead,
        IsolationLevel::Snapshot,
        IsolationLevel::Serializable,
    ];

    /// Does this level provide at least the guarantees of `other`?
    pub fn is_compatible_with(self, other: IsolationLevel) -> bool {
        self >= other
    }

    /// Upgrade a requested level to the nearest supported level that is at
    /// least as strong.
    ///
    /// Returns `UnsupportedIsolation` when no supported level is strong
    /// enough. This is the acquisition-time check: a sink or dataset request
    /// fails here, never deep into the transaction.
    pub fn upgrade_to_supported(self, supported: &[IsolationLevel]) -> Result<IsolationLevel> {
        supported
            .iter()
            .copied()
            .filter(|level| level.is_compatible_with(self))
            .min()
            .ok_or_else(|| {
                StoreError::unsupported_isolation(format!(
                    "no supported level at or above {}",
                    self
                ))
            })
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationLevel::None => "NONE",
            IsolationLevel::ReadUncommitted => "READ_UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ_COMMITTED",
            IsolationLevel::SnapshotRead => "SNAPSHOT_READ",
            IsolationLevel::Snapshot => "SNAPSHOT",
            IsolationLevel::Serializable => "SERIALIZABLE",
        };
        f.write_str(name)
    }
}
