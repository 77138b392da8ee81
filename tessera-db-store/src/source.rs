//! Source, Branch, Sink, and Dataset contracts
//!
//! A `Source` is the branchable, versioned container of statements. Forking a
//! source creates an independent child branch whose writes stay invisible to
//! the parent and to sibling forks until flushed. A `Branch` adds the
//! transaction-like `prepare`/`flush` lifecycle.
//!
//! This module also carries the seam to real storage: a flat, non-branching
//! store implements [`BackingStore`] and is adapted into a leaf `Branch` by
//! [`BackingSource`], whose lifecycle calls are no-ops because it *is* the
//! backing store. [`DelegatingBranch`] forwards every call to a shared branch
//! and can suppress `close` for all but the true owner.

use crate::branch::SourceBranch;
use crate::changeset::{ChangeBatch, Changeset};
use crate::error::{Result, StoreError};
use crate::isolation::IsolationLevel;
use crate::iter::BoxIter;
use std::sync::Arc;
use tessera_db_model::{ModelFactory, Namespace, Resource, Statement, StatementPattern};

/// A closable, point-in-time read view over a source
///
/// Datasets must be closed to release underlying resources (cursors, locks).
/// Operating on a closed dataset fails fast with [`StoreError::Closed`].
pub trait Dataset: Send + Sync {
    /// Statements matching the pattern, as a lazy single-pass sequence
    fn statements(&self, pattern: &StatementPattern) -> Result<BoxIter<Statement>>;

    /// The namespace name bound to a prefix, if any
    fn namespace(&self, prefix: &str) -> Result<Option<String>>;

    /// All namespace bindings
    fn namespaces(&self) -> Result<BoxIter<Namespace>>;

    /// All named context (graph) identifiers; the default graph is not
    /// enumerated
    fn context_ids(&self) -> Result<BoxIter<Resource>>;

    /// Release underlying resources. Idempotent.
    fn close(&self) -> Result<()>;
}

/// A write-only handle accumulating mutations into a changeset
///
/// A sink belongs to one logical writer; it is not meant to be shared across
/// threads. Closing a sink without flushing discards its pending state
/// (abort/rollback); no partial state escapes.
pub trait Sink: Send {
    /// Register a read dependency for serializable conflict checking
    fn observe(&mut self, pattern: &StatementPattern) -> Result<()>;

    /// Record a statement addition
    fn approve(&mut self, statement: Statement) -> Result<()>;

    /// Record a statement removal
    fn deprecate(&mut self, statement: &Statement) -> Result<()>;

    /// Clear all statements (empty slice) or the given contexts
    fn clear(&mut self, contexts: &[Option<Resource>]) -> Result<()>;

    /// Bind a namespace prefix
    fn set_namespace(&mut self, prefix: &str, name: &str) -> Result<()>;

    /// Remove a namespace prefix
    fn remove_namespace(&mut self, prefix: &str) -> Result<()>;

    /// Remove all namespace bindings
    fn clear_namespaces(&mut self) -> Result<()>;

    /// Validate that flushing would not violate an observed read pattern.
    ///
    /// Together with `flush`, this forms a critical section against other
    /// sinks targeting the same parent; the section is held until `close`.
    fn prepare(&mut self) -> Result<()>;

    /// Merge the pending changeset into the parent, making it visible there
    fn flush(&mut self) -> Result<()>;

    /// Release the sink, discarding pending state if not flushed. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// Branchable, versioned container of statements
pub trait Source: Send + Sync {
    /// Create an independent child branch whose flush target is this source
    fn fork(&self) -> Box<dyn Branch>;

    /// Open a read view at the given isolation level
    fn dataset(&self, level: IsolationLevel) -> Result<Box<dyn Dataset>>;

    /// Open a write handle at the given isolation level
    fn sink(&self, level: IsolationLevel) -> Result<Box<dyn Sink>>;

    /// Release the source and the resources it pinned. Idempotent.
    fn close(&self) -> Result<()>;
}

/// A source with a transaction-like lifecycle
pub trait Branch: Source {
    /// Validate pending changes against the parent (conflict detection)
    fn prepare(&self) -> Result<()>;

    /// Merge pending changes into the parent
    fn flush(&self) -> Result<()>;
}

/// Contract required of a flat, non-branching backing store
///
/// The store must provide point-in-time snapshot datasets and an atomic,
/// merge-or-nothing [`apply`](BackingStore::apply). Everything else
/// (branching, isolation between writers, conflict detection) is layered on
/// top by [`SourceBranch`].
pub trait BackingStore: Send + Sync + 'static {
    /// Isolation levels this store can honor directly
    fn supported_levels(&self) -> &[IsolationLevel];

    /// A point-in-time snapshot view of the current state
    fn dataset(&self) -> Result<Box<dyn Dataset>>;

    /// Apply a batch atomically: either every operation in the batch becomes
    /// visible or, on error, none of it does
    fn apply(&self, batch: &ChangeBatch) -> Result<()>;
}

/// Adapts a flat [`BackingStore`] into a leaf [`Branch`]
///
/// `prepare`, `flush`, and `close` are no-ops at this level: this *is* the
/// backing store, there is nothing further to propagate to. Requested
/// isolation levels are upgraded to the nearest stronger supported level; a
/// request nothing supports fails at acquisition time.
pub struct BackingSource<S> {
    store: Arc<S>,
    factory: Arc<dyn ModelFactory>,
}

impl<S> Clone for BackingSource<S> {
    fn clone(&self) -> Self {
        BackingSource {
            store: self.store.clone(),
            factory: self.factory.clone(),
        }
    }
}

impl<S: BackingStore> BackingSource<S> {
    /// Wrap a flat store
    pub fn new(store: Arc<S>, factory: Arc<dyn ModelFactory>) -> Self {
        BackingSource { store, factory }
    }

    /// The wrapped store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<S: BackingStore> Source for BackingSource<S> {
    fn fork(&self) -> Box<dyn Branch> {
        Box::new(SourceBranch::new(
            Box::new(self.clone()),
            self.factory.clone(),
        ))
    }

    fn dataset(&self, level: IsolationLevel) -> Result<Box<dyn Dataset>> {
        level.upgrade_to_supported(self.store.supported_levels())?;
        self.store.dataset()
    }

    fn sink(&self, level: IsolationLevel) -> Result<Box<dyn Sink>> {
        level.upgrade_to_supported(self.store.supported_levels())?;
        Ok(Box::new(BackingSink {
            store: self.store.clone(),
            changeset: Changeset::new(self.factory.clone()),
            closed: false,
        }))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl<S: BackingStore> Branch for BackingSource<S> {
    fn prepare(&self) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Sink writing directly against a flat backing store
///
/// Mutations stage into a private changeset; `flush` applies the whole batch
/// atomically. Observations are recorded but never checked here: no write can
/// reach the backing store without passing through this level, so conflict
/// detection has already happened in the branches above.
struct BackingSink<S> {
    store: Arc<S>,
    changeset: Changeset,
    closed: bool,
}

impl<S> BackingSink<S> {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(StoreError::closed("backing sink"))
        } else {
            Ok(())
        }
    }
}

impl<S: BackingStore> Sink for BackingSink<S> {
    fn observe(&mut self, pattern: &StatementPattern) -> Result<()> {
        self.ensure_open()?;
        self.changeset.observe(pattern.clone());
        Ok(())
    }

    fn approve(&mut self, statement: Statement) -> Result<()> {
        self.ensure_open()?;
        self.changeset.approve(statement);
        Ok(())
    }

    fn deprecate(&mut self, statement: &Statement) -> Result<()> {
        self.ensure_open()?;
        self.changeset.deprecate(statement);
        Ok(())
    }

    fn clear(&mut self, contexts: &[Option<Resource>]) -> Result<()> {
        self.ensure_open()?;
        self.changeset.clear(contexts);
        Ok(())
    }

    fn set_namespace(&mut self, prefix: &str, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.changeset.set_namespace(prefix, name);
        Ok(())
    }

    fn remove_namespace(&mut self, prefix: &str) -> Result<()> {
        self.ensure_open()?;
        self.changeset.remove_namespace(prefix);
        Ok(())
    }

    fn clear_namespaces(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.changeset.clear_namespaces();
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        self.ensure_open()
    }

    fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        let batch = self.changeset.to_batch();
        tracing::debug!(
            approved = batch.approved.len(),
            deprecated = batch.deprecated.len(),
            cleared = batch.statement_cleared,
            "applying batch to backing store"
        );
        self.store.apply(&batch)
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Forwards every call to a shared branch, optionally suppressing `close`
///
/// Used when one underlying branch is shared by multiple short-lived callers
/// and only the true owner should release it. Suppression does not leak: the
/// owner's `close` still reaches the delegate.
pub struct DelegatingBranch {
    delegate: Arc<dyn Branch>,
    releasing: bool,
}

impl DelegatingBranch {
    /// Wrap a shared branch; `releasing` controls whether `close` is
    /// forwarded
    pub fn new(delegate: Arc<dyn Branch>, releasing: bool) -> Self {
        DelegatingBranch {
            delegate,
            releasing,
        }
    }
}

impl Source for DelegatingBranch {
    fn fork(&self) -> Box<dyn Branch> {
        self.delegate.fork()
    }

    fn dataset(&self, level: IsolationLevel) -> Result<Box<dyn Dataset>> {
        self.delegate.dataset(level)
    }

    fn sink(&self, level: IsolationLevel) -> Result<Box<dyn Sink>> {
        self.delegate.sink(level)
    }

    fn close(&self) -> Result<()> {
        if self.releasing {
            self.delegate.close()
        } else {
            Ok(())
        }
    }
}

impl Branch for DelegatingBranch {
    fn prepare(&self) -> Result<()> {
        self.delegate.prepare()
    }

    fn flush(&self) -> Result<()> {
        self.delegate.flush()
    }
}

/// Non-owning view of a shared dataset; `close` is a no-op
///
/// Used for a branch's pinned snapshot, which stays open for the lifetime of
/// the branch while individual derived datasets come and go.
pub(crate) struct SharedDataset {
    inner: Arc<dyn Dataset>,
}

impl SharedDataset {
    pub fn new(inner: Arc<dyn Dataset>) -> Self {
        SharedDataset { inner }
    }
}

impl Dataset for SharedDataset {
    fn statements(&self, pattern: &StatementPattern) -> Result<BoxIter<Statement>> {
        self.inner.statements(pattern)
    }

    fn namespace(&self, prefix: &str) -> Result<Option<String>> {
        self.inner.namespace(prefix)
    }

    fn namespaces(&self) -> Result<BoxIter<Namespace>> {
        self.inner.namespaces()
    }

    fn context_ids(&self) -> Result<BoxIter<Resource>> {
        self.inner.context_ids()
    }

    fn close(&self) -> Result<()> {
        // the snapshot owner closes the real dataset
        Ok(())
    }
}
