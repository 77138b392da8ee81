//! In-memory flat store
//!
//! `MemoryStore` keeps its whole state in one immutable snapshot behind an
//! `Arc`. Readers clone the `Arc`; writers clone the snapshot, mutate the
//! copy, and swap it in under a write lock. Open datasets keep reading the
//! snapshot they captured, which gives the store snapshot isolation without
//! any per-read locking, and every level up to serializable is honored (the
//! branch layer supplies the conflict detection).

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tessera_db_store::iter::VecCursor;
use tessera_db_store::{
    BackingSource, BackingStore, BoxIter, ChangeBatch, Dataset, IsolationLevel, Result,
    SnapshotStore,
};
use tessera_db_model::{
    ModelFactory, Namespace, Resource, Statement, StatementPattern, TreeModelFactory,
};

#[derive(Default, Clone)]
struct MemoryState {
    statements: BTreeSet<Statement>,
    namespaces: BTreeMap<String, String>,
}

/// Flat in-memory statement store
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<Arc<MemoryState>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Lift this store into a branchable source
    pub fn source(self: &Arc<Self>, factory: Arc<dyn ModelFactory>) -> BackingSource<MemoryStore> {
        BackingSource::new(self.clone(), factory)
    }

    /// Number of statements currently stored
    pub fn len(&self) -> usize {
        self.state.read().statements.len()
    }

    /// True when no statements are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exact membership test against the current state
    pub fn contains(&self, statement: &Statement) -> bool {
        self.state.read().statements.contains(statement)
    }
}

impl BackingStore for MemoryStore {
    fn supported_levels(&self) -> &[IsolationLevel] {
        &IsolationLevel::ALL
    }

    fn dataset(&self) -> Result<Box<dyn Dataset>> {
        Ok(Box::new(MemoryDataset {
            state: self.state.read().clone(),
        }))
    }

    fn apply(&self, batch: &ChangeBatch) -> Result<()> {
        let mut guard = self.state.write();
        let mut next = (**guard).clone();
        if batch.namespace_cleared {
            next.namespaces.clear();
        }
        for prefix in &batch.removed_prefixes {
            next.namespaces.remove(prefix);
        }
        for (prefix, name) in &batch.added_namespaces {
            next.namespaces.insert(prefix.clone(), name.clone());
        }
        if batch.statement_cleared {
            next.statements.clear();
        }
        if !batch.deprecated_contexts.is_empty() {
            next.statements.retain(|statement| {
                !batch
                    .deprecated_contexts
                    .iter()
                    .any(|ctx| ctx.as_ref() == statement.context())
            });
        }
        for statement in &batch.deprecated {
            next.statements.remove(statement);
        }
        for statement in &batch.approved {
            next.statements.insert(statement.clone());
        }
        tracing::debug!(
            added = batch.approved.len(),
            removed = batch.deprecated.len(),
            total = next.statements.len(),
            "applied batch"
        );
        *guard = Arc::new(next);
        Ok(())
    }
}

/// Point-in-time view over one captured snapshot
struct MemoryDataset {
    state: Arc<MemoryState>,
}

impl Dataset for MemoryDataset {
    fn statements(&self, pattern: &StatementPattern) -> Result<BoxIter<Statement>> {
        Ok(VecCursor::boxed(
            self.state
                .statements
                .iter()
                .filter(|statement| pattern.matches(statement))
                .cloned()
                .collect(),
        ))
    }

    fn namespace(&self, prefix: &str) -> Result<Option<String>> {
        Ok(self.state.namespaces.get(prefix).cloned())
    }

    fn namespaces(&self) -> Result<BoxIter<Namespace>> {
        Ok(VecCursor::boxed(
            self.state
                .namespaces
                .iter()
                .map(|(prefix, name)| Namespace::new(prefix.clone(), name.clone()))
                .collect(),
        ))
    }

    fn context_ids(&self) -> Result<BoxIter<Resource>> {
        let mut ids: Vec<Resource> = Vec::new();
        for statement in &self.state.statements {
            if let Some(ctx) = statement.context() {
                if !ids.contains(ctx) {
                    ids.push(ctx.clone());
                }
            }
        }
        Ok(VecCursor::boxed(ids))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Ready-to-use store: two in-memory sides behind auto-flushing branches
pub fn snapshot_store() -> SnapshotStore {
    let factory: Arc<dyn ModelFactory> = Arc::new(TreeModelFactory);
    let explicit = Arc::new(MemoryStore::new());
    let inferred = Arc::new(MemoryStore::new());
    SnapshotStore::new(
        Box::new(explicit.source(factory.clone())),
        Box::new(inferred.source(factory.clone())),
        factory,
    )
}
