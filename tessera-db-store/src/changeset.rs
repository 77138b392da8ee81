//! Changeset - the pending delta of one write handle
//!
//! A `Changeset` records additions, removals, context clears, namespace
//! edits, and observed read patterns relative to its parent state. It is
//! shared between the sink writing it and every dataset layering over it, so
//! all state lives behind one mutex; readers take consistent snapshots of the
//! pieces they need (see [`StatementReadView`]).
//!
//! Bookkeeping methods never fail. Failure surfaces at the boundary
//! operations: `check_conflicts` (serialization conflict) and downstream at
//! flush time if the backing store rejects the merge.
//!
//! ## Invariants
//!
//! - `approved` and `deprecated` are disjoint: approving a statement that is
//!   pending removal cancels the removal instead, and vice versa.
//! - Once `statement_cleared` is set, earlier approved/deprecated entries are
//!   dropped; only statements approved after the clear remain tracked.

use crate::error::{Result, StoreError};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tessera_db_model::{
    ContextFilter, ModelFactory, Resource, StagingModel, Statement, StatementPattern,
};

/// Overlay answer for a single namespace prefix lookup
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum NamespaceOverride {
    /// This change binds the prefix to the given name
    Added(String),
    /// This change removes the prefix (or cleared all namespaces)
    Removed,
    /// This change says nothing about the prefix
    Unset,
}

/// Consistent snapshot of the pieces a layered statement read needs
pub(crate) struct StatementReadView {
    pub statement_cleared: bool,
    pub deprecated_contexts: Option<FxHashSet<Option<Resource>>>,
    pub deprecated_matching: Vec<Statement>,
    pub approved_matching: Vec<Statement>,
}

/// Flat snapshot of a changeset's contents, in merge-application order.
///
/// This is the unit a flat backing store receives in
/// [`BackingStore::apply`](crate::source::BackingStore::apply): application
/// must be atomic (merge-or-nothing).
#[derive(Clone, Debug, Default)]
pub struct ChangeBatch {
    /// Observed read patterns (ignored by flat stores)
    pub observed: Vec<StatementPattern>,
    /// Statements to add
    pub approved: Vec<Statement>,
    /// Statements to remove
    pub deprecated: Vec<Statement>,
    /// Contexts to clear before removals/additions
    pub deprecated_contexts: Vec<Option<Resource>>,
    /// Namespace bindings to add
    pub added_namespaces: Vec<(String, String)>,
    /// Namespace prefixes to remove
    pub removed_prefixes: Vec<String>,
    /// Wipe all namespace bindings first
    pub namespace_cleared: bool,
    /// Wipe all statements first
    pub statement_cleared: bool,
}

#[derive(Default)]
struct ChangesetState {
    /// Dataset handles currently reading through this changeset
    refbacks: FxHashSet<u64>,
    /// Changesets flushed by other sinks against the same parent since this
    /// one was opened; inputs to the serializable conflict check
    prepend: Vec<Arc<Changeset>>,
    observed: Option<FxHashSet<StatementPattern>>,
    approved: Option<Box<dyn StagingModel>>,
    deprecated: Option<Box<dyn StagingModel>>,
    approved_contexts: Option<FxHashSet<Resource>>,
    deprecated_contexts: Option<FxHashSet<Option<Resource>>>,
    added_namespaces: Option<FxHashMap<String, String>>,
    removed_prefixes: Option<FxHashSet<String>>,
    namespace_cleared: bool,
    statement_cleared: bool,
}

/// In-memory record of pending additions, removals, namespace changes, and
/// observed read patterns, not yet applied to the parent
pub struct Changeset {
    factory: Arc<dyn ModelFactory>,
    state: Mutex<ChangesetState>,
}

impl Changeset {
    /// Create an empty changeset; staged statements go into models produced
    /// by the given factory
    pub fn new(factory: Arc<dyn ModelFactory>) -> Self {
        Changeset {
            factory,
            state: Mutex::new(ChangesetState::default()),
        }
    }

    /// Record an addition.
    ///
    /// If the statement is pending removal, the removal is canceled instead
    /// (net no-op relative to the parent).
    pub fn approve(&self, statement: Statement) {
        let mut state = self.state.lock();
        if let Some(deprecated) = &mut state.deprecated {
            if deprecated.remove(&statement) {
                return;
            }
        }
        let context = statement.context().cloned();
        state
            .approved
            .get_or_insert_with(|| self.factory.create_model())
            .add(statement);
        if let Some(ctx) = context {
            state
                .approved_contexts
                .get_or_insert_with(FxHashSet::default)
                .insert(ctx);
        }
    }

    /// Record a removal.
    ///
    /// If the statement is pending addition, the addition is canceled
    /// instead.
    pub fn deprecate(&self, statement: &Statement) {
        let mut state = self.state.lock();
        let was_approved = match &mut state.approved {
            Some(approved) => approved.remove(statement),
            None => false,
        };
        if was_approved {
            // drop the context from approvedContexts if nothing else
            // approved in it remains
            if let Some(ctx) = statement.context() {
                let still_used = state
                    .approved
                    .as_ref()
                    .map(|approved| {
                        approved.contains_matching(
                            &StatementPattern::any()
                                .in_contexts(vec![Some(ctx.clone())]),
                        )
                    })
                    .unwrap_or(false);
                if !still_used {
                    if let Some(contexts) = &mut state.approved_contexts {
                        contexts.remove(ctx);
                    }
                }
            }
            return;
        }
        state
            .deprecated
            .get_or_insert_with(|| self.factory.create_model())
            .add(statement.clone());
    }

    /// Record a clear.
    ///
    /// An empty context slice wipes the whole store: prior approved and
    /// deprecated bookkeeping is subsumed and dropped, and only statements
    /// approved afterwards are tracked. With specific contexts, approved
    /// entries scoped to them are dropped and the contexts are marked
    /// deprecated.
    pub fn clear(&self, contexts: &[Option<Resource>]) {
        let mut state = self.state.lock();
        if contexts.is_empty() {
            state.approved = None;
            state.deprecated = None;
            state.approved_contexts = None;
            state.deprecated_contexts = None;
            state.statement_cleared = true;
        } else {
            let pattern = StatementPattern::any().in_contexts(contexts.to_vec());
            if let Some(approved) = &mut state.approved {
                approved.remove_matching(&pattern);
            }
            if let Some(approved_contexts) = &mut state.approved_contexts {
                for ctx in contexts.iter().flatten() {
                    approved_contexts.remove(ctx);
                }
            }
            state
                .deprecated_contexts
                .get_or_insert_with(FxHashSet::default)
                .extend(contexts.iter().cloned());
        }
    }

    /// Bind a namespace prefix
    pub fn set_namespace(&self, prefix: &str, name: &str) {
        let mut state = self.state.lock();
        state
            .removed_prefixes
            .get_or_insert_with(FxHashSet::default)
            .insert(prefix.to_string());
        state
            .added_namespaces
            .get_or_insert_with(FxHashMap::default)
            .insert(prefix.to_string(), name.to_string());
    }

    /// Remove a namespace prefix
    pub fn remove_namespace(&self, prefix: &str) {
        let mut state = self.state.lock();
        if let Some(added) = &mut state.added_namespaces {
            added.remove(prefix);
        }
        state
            .removed_prefixes
            .get_or_insert_with(FxHashSet::default)
            .insert(prefix.to_string());
    }

    /// Remove all namespace bindings
    pub fn clear_namespaces(&self) {
        let mut state = self.state.lock();
        state.removed_prefixes = None;
        state.added_namespaces = None;
        state.namespace_cleared = true;
    }

    /// Record that this transaction's correctness depends on the matched
    /// pattern not changing concurrently
    pub fn observe(&self, pattern: StatementPattern) {
        self.state
            .lock()
            .observed
            .get_or_insert_with(FxHashSet::default)
            .insert(pattern);
    }

    /// Register a dataset reading through this changeset
    pub fn add_refback(&self, dataset_id: u64) {
        self.state.lock().refbacks.insert(dataset_id);
    }

    /// Deregister a dataset
    pub fn remove_refback(&self, dataset_id: u64) {
        self.state.lock().refbacks.remove(&dataset_id);
    }

    /// Is any dataset still reading through this changeset?
    pub fn has_refback(&self) -> bool {
        !self.state.lock().refbacks.is_empty()
    }

    /// Note a changeset flushed by a different sink against the same parent
    pub(crate) fn prepend(&self, changeset: Arc<Changeset>) {
        self.state.lock().prepend.push(changeset);
    }

    /// Check every observed pattern against changesets flushed by other
    /// sinks since this one was opened.
    ///
    /// Fails with [`StoreError::Conflict`] when a concurrently flushed sink
    /// added or removed a statement matching an observed pattern, or wiped
    /// the store outright.
    pub fn check_conflicts(&self) -> Result<()> {
        let (observed, prepend) = {
            let state = self.state.lock();
            let observed: Vec<StatementPattern> = match &state.observed {
                Some(observed) => observed.iter().cloned().collect(),
                None => return Ok(()),
            };
            (observed, state.prepend.clone())
        };
        if prepend.is_empty() {
            return Ok(());
        }
        for pattern in &observed {
            for other in &prepend {
                let state = other.state.lock();
                let invalidated = state.statement_cleared
                    || state
                        .approved
                        .as_ref()
                        .is_some_and(|approved| approved.contains_matching(pattern))
                    || state
                        .deprecated
                        .as_ref()
                        .is_some_and(|deprecated| deprecated.contains_matching(pattern));
                if invalidated {
                    return Err(StoreError::conflict(format!(
                        "observed state has changed: {}",
                        pattern
                    )));
                }
            }
        }
        Ok(())
    }

    /// Does this changeset carry anything worth merging?
    pub fn has_changes(&self) -> bool {
        let state = self.state.lock();
        state.approved.is_some()
            || state.deprecated.is_some()
            || state.approved_contexts.is_some()
            || state.deprecated_contexts.is_some()
            || state.added_namespaces.is_some()
            || state.removed_prefixes.is_some()
            || state.statement_cleared
            || state.namespace_cleared
            || state.observed.is_some()
    }

    /// Consistent view of the pieces a layered statement read needs
    pub(crate) fn statement_read_view(&self, pattern: &StatementPattern) -> StatementReadView {
        let state = self.state.lock();
        StatementReadView {
            statement_cleared: state.statement_cleared,
            deprecated_contexts: state.deprecated_contexts.clone(),
            deprecated_matching: match &state.deprecated {
                Some(deprecated) => deprecated.matching(pattern),
                None => Vec::new(),
            },
            approved_matching: match &state.approved {
                Some(approved) => approved.matching(pattern),
                None => Vec::new(),
            },
        }
    }

    /// Overlay answer for one namespace prefix
    pub fn namespace_override(&self, prefix: &str) -> NamespaceOverride {
        let state = self.state.lock();
        if let Some(added) = &state.added_namespaces {
            if let Some(name) = added.get(prefix) {
                return NamespaceOverride::Added(name.clone());
            }
        }
        let removed = state
            .removed_prefixes
            .as_ref()
            .is_some_and(|removed| removed.contains(prefix));
        if removed || state.namespace_cleared {
            NamespaceOverride::Removed
        } else {
            NamespaceOverride::Unset
        }
    }

    /// Namespace overlay pieces: (cleared, removed prefixes, added bindings)
    pub(crate) fn namespace_view(&self) -> (bool, Vec<String>, Vec<(String, String)>) {
        let state = self.state.lock();
        let removed = state
            .removed_prefixes
            .as_ref()
            .map(|removed| removed.iter().cloned().collect())
            .unwrap_or_default();
        let added = state
            .added_namespaces
            .as_ref()
            .map(|added| {
                added
                    .iter()
                    .map(|(prefix, name)| (prefix.clone(), name.clone()))
                    .collect()
            })
            .unwrap_or_default();
        (state.namespace_cleared, removed, added)
    }

    /// Context-id overlay pieces: (cleared, deprecated contexts, approved contexts)
    pub(crate) fn context_view(
        &self,
    ) -> (bool, Vec<Option<Resource>>, Vec<Resource>) {
        let state = self.state.lock();
        let deprecated = state
            .deprecated_contexts
            .as_ref()
            .map(|contexts| contexts.iter().cloned().collect())
            .unwrap_or_default();
        let approved = state
            .approved_contexts
            .as_ref()
            .map(|contexts| contexts.iter().cloned().collect())
            .unwrap_or_default();
        (state.statement_cleared, deprecated, approved)
    }

    /// Flat snapshot of this changeset's contents, in merge-application order
    pub fn to_batch(&self) -> ChangeBatch {
        let state = self.state.lock();
        ChangeBatch {
            observed: state
                .observed
                .as_ref()
                .map(|observed| observed.iter().cloned().collect())
                .unwrap_or_default(),
            approved: state
                .approved
                .as_ref()
                .map(|approved| approved.statements())
                .unwrap_or_default(),
            deprecated: state
                .deprecated
                .as_ref()
                .map(|deprecated| deprecated.statements())
                .unwrap_or_default(),
            deprecated_contexts: state
                .deprecated_contexts
                .as_ref()
                .map(|contexts| contexts.iter().cloned().collect())
                .unwrap_or_default(),
            added_namespaces: state
                .added_namespaces
                .as_ref()
                .map(|added| {
                    added
                        .iter()
                        .map(|(prefix, name)| (prefix.clone(), name.clone()))
                        .collect()
                })
                .unwrap_or_default(),
            removed_prefixes: state
                .removed_prefixes
                .as_ref()
                .map(|removed| removed.iter().cloned().collect())
                .unwrap_or_default(),
            namespace_cleared: state.namespace_cleared,
            statement_cleared: state.statement_cleared,
        }
    }
}

impl std::fmt::Debug for Changeset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Changeset")
            .field("statement_cleared", &state.statement_cleared)
            .field("namespace_cleared", &state.namespace_cleared)
            .field(
                "approved",
                &state.approved.as_ref().map(|m| m.len()).unwrap_or(0),
            )
            .field(
                "deprecated",
                &state.deprecated.as_ref().map(|m| m.len()).unwrap_or(0),
            )
            .field("refbacks", &state.refbacks.len())
            .finish()
    }
}

/// Pattern-less helper: does this context filter stay inside the given
/// deprecated set? Used by the layered read path.
pub(crate) fn contexts_fully_deprecated(
    filter: &ContextFilter,
    deprecated: &FxHashSet<Option<Resource>>,
) -> bool {
    match filter {
        ContextFilter::Any => false,
        ContextFilter::In(contexts) => {
            !contexts.is_empty() && contexts.iter().all(|ctx| deprecated.contains(ctx))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_db_model::{Iri, TreeModelFactory, Value};

    fn changeset() -> Changeset {
        Changeset::new(Arc::new(TreeModelFactory))
    }

    fn stmt(s: &str, ctx: Option<&str>) -> Statement {
        Statement::with_context(
            Resource::iri(s),
            Iri::new("urn:p"),
            Value::iri("urn:o"),
            ctx.map(Resource::iri),
        )
    }

    fn all(cs: &Changeset) -> StatementReadView {
        cs.statement_read_view(&StatementPattern::any())
    }

    #[test]
    fn test_approve_then_deprecate_cancels() {
        let cs = changeset();
        cs.approve(stmt("urn:a", None));
        cs.deprecate(&stmt("urn:a", None));

        let view = all(&cs);
        assert!(view.approved_matching.is_empty());
        assert!(view.deprecated_matching.is_empty());
    }

    #[test]
    fn test_deprecate_then_approve_cancels() {
        let cs = changeset();
        cs.deprecate(&stmt("urn:a", None));
        cs.approve(stmt("urn:a", None));

        let view = all(&cs);
        assert!(view.approved_matching.is_empty());
        assert!(view.deprecated_matching.is_empty());
    }

    #[test]
    fn test_full_clear_subsumes_prior_bookkeeping() {
        let cs = changeset();
        cs.approve(stmt("urn:a", None));
        cs.deprecate(&stmt("urn:b", None));
        cs.clear(&[]);
        cs.approve(stmt("urn:c", None));

        let view = all(&cs);
        assert!(view.statement_cleared);
        assert_eq!(view.approved_matching, vec![stmt("urn:c", None)]);
        assert!(view.deprecated_matching.is_empty());
    }

    #[test]
    fn test_context_clear_drops_scoped_approvals() {
        let cs = changeset();
        cs.approve(stmt("urn:a", Some("urn:g1")));
        cs.approve(stmt("urn:b", Some("urn:g2")));
        cs.clear(&[Some(Resource::iri("urn:g1"))]);

        let view = all(&cs);
        assert!(!view.statement_cleared);
        assert_eq!(view.approved_matching, vec![stmt("urn:b", Some("urn:g2"))]);
        let deprecated = view.deprecated_contexts.unwrap();
        assert!(deprecated.contains(&Some(Resource::iri("urn:g1"))));

        let (_, _, approved_contexts) = cs.context_view();
        assert_eq!(approved_contexts, vec![Resource::iri("urn:g2")]);
    }

    #[test]
    fn test_namespace_cancellation() {
        let cs = changeset();
        cs.set_namespace("ex", "http://example.com/");
        assert_eq!(
            cs.namespace_override("ex"),
            NamespaceOverride::Added("http://example.com/".to_string())
        );
        cs.remove_namespace("ex");
        assert_eq!(cs.namespace_override("ex"), NamespaceOverride::Removed);
        assert_eq!(cs.namespace_override("other"), NamespaceOverride::Unset);
    }

    #[test]
    fn test_clear_namespaces_removes_all() {
        let cs = changeset();
        cs.set_namespace("ex", "http://example.com/");
        cs.clear_namespaces();
        assert_eq!(cs.namespace_override("ex"), NamespaceOverride::Removed);
        assert_eq!(cs.namespace_override("foaf"), NamespaceOverride::Removed);
    }

    #[test]
    fn test_conflict_on_matching_concurrent_write() {
        let cs = changeset();
        cs.observe(StatementPattern::new(Some(Resource::iri("urn:s")), None, None));

        let other = Arc::new(changeset());
        other.approve(Statement::new(
            Resource::iri("urn:s"),
            Iri::new("urn:p"),
            Value::iri("urn:o2"),
        ));
        cs.prepend(other);

        let err = cs.check_conflicts().unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_no_conflict_on_disjoint_concurrent_write() {
        let cs = changeset();
        cs.observe(StatementPattern::new(Some(Resource::iri("urn:s")), None, None));

        let other = Arc::new(changeset());
        other.approve(Statement::new(
            Resource::iri("urn:unrelated"),
            Iri::new("urn:p"),
            Value::iri("urn:o"),
        ));
        cs.prepend(other);

        cs.check_conflicts().unwrap();
    }

    #[test]
    fn test_observe_everything_conflicts_with_any_write() {
        let cs = changeset();
        cs.observe(StatementPattern::any());

        let other = Arc::new(changeset());
        other.deprecate(&stmt("urn:whatever", None));
        cs.prepend(other);

        assert!(cs.check_conflicts().unwrap_err().is_conflict());
    }

    #[test]
    fn test_concurrent_full_clear_conflicts() {
        let cs = changeset();
        cs.observe(StatementPattern::new(Some(Resource::iri("urn:s")), None, None));

        let other = Arc::new(changeset());
        other.clear(&[]);
        cs.prepend(other);

        assert!(cs.check_conflicts().unwrap_err().is_conflict());
    }

    #[test]
    fn test_refbacks() {
        let cs = changeset();
        assert!(!cs.has_refback());
        cs.add_refback(7);
        assert!(cs.has_refback());
        cs.remove_refback(7);
        assert!(!cs.has_refback());
    }

    #[test]
    fn test_has_changes() {
        let cs = changeset();
        assert!(!cs.has_changes());
        cs.set_namespace("ex", "http://example.com/");
        assert!(cs.has_changes());
    }
}
