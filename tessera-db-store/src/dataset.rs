//! Layered read views
//!
//! A [`DerivedDataset`] stacks one changeset over a parent dataset. Reads
//! apply the changeset as an overlay: a full clear empties the parent view,
//! cleared contexts and deprecated statements are subtracted, and approved
//! statements are appended (bag union, no duplicate suppression). Stacking
//! one derived dataset per unflushed changeset reconstructs the branch head.
//!
//! [`ObservingDataset`] wraps any dataset and records every statement read
//! into a changeset as an observed pattern, which is what makes serializable
//! conflict detection possible at prepare time.

use crate::changeset::{contexts_fully_deprecated, Changeset, NamespaceOverride};
use crate::error::{Result, StoreError};
use crate::iter::{BoxIter, ChainCursor, ClosableIter, EmptyCursor, FilterCursor, VecCursor};
use crate::source::Dataset;
use rustc_hash::FxHashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tessera_db_model::{ContextFilter, Namespace, Resource, Statement, StatementPattern};

static NEXT_DATASET_ID: AtomicU64 = AtomicU64::new(1);

/// One changeset layered over a parent dataset
///
/// Holds a refback on its changeset for as long as it is open, which blocks
/// the branch from folding that changeset into an older one underneath a
/// live reader.
pub struct DerivedDataset {
    id: u64,
    parent: Box<dyn Dataset>,
    changeset: Arc<Changeset>,
    closed: AtomicBool,
}

impl DerivedDataset {
    /// Layer a changeset over a parent view
    pub fn new(parent: Box<dyn Dataset>, changeset: Arc<Changeset>) -> Self {
        let id = NEXT_DATASET_ID.fetch_add(1, Ordering::Relaxed);
        changeset.add_refback(id);
        DerivedDataset {
            id,
            parent,
            changeset,
            closed: AtomicBool::new(false),
        }
    }

    /// Boxed convenience constructor
    pub fn boxed(parent: Box<dyn Dataset>, changeset: Arc<Changeset>) -> Box<dyn Dataset> {
        Box::new(Self::new(parent, changeset))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::closed("derived dataset"))
        } else {
            Ok(())
        }
    }

    /// Parent-side sequence for a pattern, after applying clears.
    ///
    /// A statement whose context was cleared in this changeset must not leak
    /// through, even for wildcard-context reads, so `Any`-context patterns
    /// get a post-filter rather than a narrowed pattern.
    fn parent_statements(
        &self,
        pattern: &StatementPattern,
        cleared: bool,
        deprecated_contexts: Option<FxHashSet<Option<Resource>>>,
    ) -> Result<BoxIter<Statement>> {
        if cleared {
            return Ok(EmptyCursor::boxed());
        }
        let deprecated = match deprecated_contexts {
            Some(deprecated) if !deprecated.is_empty() => deprecated,
            _ => return self.parent.statements(pattern),
        };
        if contexts_fully_deprecated(&pattern.contexts, &deprecated) {
            return Ok(EmptyCursor::boxed());
        }
        match &pattern.contexts {
            ContextFilter::In(contexts) => {
                let remaining: Vec<Option<Resource>> = contexts
                    .iter()
                    .filter(|ctx| !deprecated.contains(*ctx))
                    .cloned()
                    .collect();
                let narrowed = pattern.clone().in_contexts(remaining);
                self.parent.statements(&narrowed)
            }
            ContextFilter::Any => {
                let inner = self.parent.statements(pattern)?;
                Ok(FilterCursor::boxed(inner, move |statement: &Statement| {
                    !deprecated.contains(&statement.context().cloned())
                }))
            }
        }
    }
}

impl Dataset for DerivedDataset {
    fn statements(&self, pattern: &StatementPattern) -> Result<BoxIter<Statement>> {
        self.ensure_open()?;
        let view = self.changeset.statement_read_view(pattern);
        let parent = self.parent_statements(
            pattern,
            view.statement_cleared,
            view.deprecated_contexts,
        )?;
        let visible = if view.deprecated_matching.is_empty() {
            parent
        } else {
            let deprecated: FxHashSet<Statement> =
                view.deprecated_matching.into_iter().collect();
            FilterCursor::boxed(parent, move |statement: &Statement| {
                !deprecated.contains(statement)
            })
        };
        if view.approved_matching.is_empty() {
            Ok(visible)
        } else {
            Ok(ChainCursor::boxed(
                visible,
                VecCursor::boxed(view.approved_matching),
            ))
        }
    }

    fn namespace(&self, prefix: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        match self.changeset.namespace_override(prefix) {
            NamespaceOverride::Added(name) => Ok(Some(name)),
            NamespaceOverride::Removed => Ok(None),
            NamespaceOverride::Unset => self.parent.namespace(prefix),
        }
    }

    fn namespaces(&self) -> Result<BoxIter<Namespace>> {
        self.ensure_open()?;
        let (cleared, removed, added) = self.changeset.namespace_view();
        let mut bindings: Vec<Namespace> = Vec::new();
        if !cleared {
            let mut parent = self.parent.namespaces()?;
            while let Some(namespace) = parent.next()? {
                if !removed.iter().any(|prefix| prefix == namespace.prefix()) {
                    bindings.push(namespace);
                }
            }
            parent.close()?;
        }
        // set_namespace records the prefix as removed too, so a re-bound
        // prefix never appears twice
        for (prefix, name) in added {
            bindings.push(Namespace::new(prefix, name));
        }
        Ok(VecCursor::boxed(bindings))
    }

    fn context_ids(&self) -> Result<BoxIter<Resource>> {
        self.ensure_open()?;
        let (cleared, deprecated, approved) = self.changeset.context_view();
        let deprecated: FxHashSet<Option<Resource>> = deprecated.into_iter().collect();
        let parent: BoxIter<Resource> = if cleared {
            EmptyCursor::boxed()
        } else if deprecated.is_empty() {
            self.parent.context_ids()?
        } else {
            let inner = self.parent.context_ids()?;
            FilterCursor::boxed(inner, move |ctx: &Resource| {
                !deprecated.contains(&Some(ctx.clone()))
            })
        };
        if approved.is_empty() {
            Ok(parent)
        } else {
            Ok(ChainCursor::boxed(parent, VecCursor::boxed(approved)))
        }
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.changeset.remove_refback(self.id);
            self.parent.close()?;
        }
        Ok(())
    }
}

impl Drop for DerivedDataset {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.close();
        }
    }
}

/// Records every statement read into a changeset as an observed pattern
///
/// Wrapped around the head view of a serializable transaction. `context_ids`
/// observes the all-wildcard pattern, since any write could add or remove a
/// context.
pub struct ObservingDataset {
    inner: Box<dyn Dataset>,
    changeset: Arc<Changeset>,
}

impl ObservingDataset {
    /// Wrap a dataset; observations go into the given changeset
    pub fn new(inner: Box<dyn Dataset>, changeset: Arc<Changeset>) -> Self {
        ObservingDataset { inner, changeset }
    }

    /// Boxed convenience constructor
    pub fn boxed(inner: Box<dyn Dataset>, changeset: Arc<Changeset>) -> Box<dyn Dataset> {
        Box::new(Self::new(inner, changeset))
    }
}

impl Dataset for ObservingDataset {
    fn statements(&self, pattern: &StatementPattern) -> Result<BoxIter<Statement>> {
        self.changeset.observe(pattern.clone());
        self.inner.statements(pattern)
    }

    fn namespace(&self, prefix: &str) -> Result<Option<String>> {
        self.inner.namespace(prefix)
    }

    fn namespaces(&self) -> Result<BoxIter<Namespace>> {
        self.inner.namespaces()
    }

    fn context_ids(&self) -> Result<BoxIter<Resource>> {
        self.changeset.observe(StatementPattern::any());
        self.inner.context_ids()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iter::collect_all;
    use tessera_db_model::{Iri, TreeModelFactory, Value};

    /// Fixed in-memory dataset for layering tests
    struct FixtureDataset {
        statements: Vec<Statement>,
        namespaces: Vec<(String, String)>,
    }

    impl FixtureDataset {
        fn boxed(statements: Vec<Statement>) -> Box<dyn Dataset> {
            Box::new(FixtureDataset {
                statements,
                namespaces: Vec::new(),
            })
        }

        fn with_namespaces(
            statements: Vec<Statement>,
            namespaces: Vec<(&str, &str)>,
        ) -> Box<dyn Dataset> {
            Box::new(FixtureDataset {
                statements,
                namespaces: namespaces
                    .into_iter()
                    .map(|(p, n)| (p.to_string(), n.to_string()))
                    .collect(),
            })
        }
    }

    impl Dataset for FixtureDataset {
        fn statements(&self, pattern: &StatementPattern) -> Result<BoxIter<Statement>> {
            Ok(VecCursor::boxed(
                self.statements
                    .iter()
                    .filter(|s| pattern.matches(s))
                    .cloned()
                    .collect(),
            ))
        }

        fn namespace(&self, prefix: &str) -> Result<Option<String>> {
            Ok(self
                .namespaces
                .iter()
                .find(|(p, _)| p == prefix)
                .map(|(_, n)| n.clone()))
        }

        fn namespaces(&self) -> Result<BoxIter<Namespace>> {
            Ok(VecCursor::boxed(
                self.namespaces
                    .iter()
                    .map(|(p, n)| Namespace::new(p.clone(), n.clone()))
                    .collect(),
            ))
        }

        fn context_ids(&self) -> Result<BoxIter<Resource>> {
            let mut ids: Vec<Resource> = Vec::new();
            for statement in &self.statements {
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

    fn stmt(s: &str, ctx: Option<&str>) -> Statement {
        Statement::with_context(
            Resource::iri(s),
            Iri::new("urn:p"),
            Value::iri("urn:o"),
            ctx.map(Resource::iri),
        )
    }

    fn changeset() -> Arc<Changeset> {
        Arc::new(Changeset::new(Arc::new(TreeModelFactory)))
    }

    fn read_all(dataset: &dyn Dataset) -> Vec<Statement> {
        collect_all(dataset.statements(&StatementPattern::any()).unwrap()).unwrap()
    }

    #[test]
    fn test_overlay_subtracts_and_appends() {
        let cs = changeset();
        cs.deprecate(&stmt("urn:a", None));
        cs.approve(stmt("urn:c", None));
        let dataset = DerivedDataset::new(
            FixtureDataset::boxed(vec![stmt("urn:a", None), stmt("urn:b", None)]),
            cs,
        );

        assert_eq!(read_all(&dataset), vec![stmt("urn:b", None), stmt("urn:c", None)]);
    }

    #[test]
    fn test_reapproved_statement_yields_duplicate() {
        let cs = changeset();
        cs.approve(stmt("urn:a", None));
        let dataset =
            DerivedDataset::new(FixtureDataset::boxed(vec![stmt("urn:a", None)]), cs);

        // bag union: the overlay never deduplicates against the parent
        assert_eq!(read_all(&dataset), vec![stmt("urn:a", None), stmt("urn:a", None)]);
    }

    #[test]
    fn test_full_clear_hides_parent() {
        let cs = changeset();
        cs.clear(&[]);
        cs.approve(stmt("urn:new", None));
        let dataset = DerivedDataset::new(
            FixtureDataset::boxed(vec![stmt("urn:old1", None), stmt("urn:old2", None)]),
            cs,
        );

        assert_eq!(read_all(&dataset), vec![stmt("urn:new", None)]);
    }

    #[test]
    fn test_context_clear_hides_context_from_scoped_read() {
        let cs = changeset();
        cs.clear(&[Some(Resource::iri("urn:g1"))]);
        let dataset = DerivedDataset::new(
            FixtureDataset::boxed(vec![
                stmt("urn:a", Some("urn:g1")),
                stmt("urn:b", Some("urn:g2")),
            ]),
            cs,
        );

        let scoped = StatementPattern::any().in_contexts(vec![Some(Resource::iri("urn:g1"))]);
        assert!(collect_all(dataset.statements(&scoped).unwrap())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_context_clear_hides_context_from_wildcard_read() {
        let cs = changeset();
        cs.clear(&[Some(Resource::iri("urn:g1"))]);
        let dataset = DerivedDataset::new(
            FixtureDataset::boxed(vec![
                stmt("urn:a", Some("urn:g1")),
                stmt("urn:b", Some("urn:g2")),
                stmt("urn:c", None),
            ]),
            cs,
        );

        assert_eq!(
            read_all(&dataset),
            vec![stmt("urn:b", Some("urn:g2")), stmt("urn:c", None)]
        );
    }

    #[test]
    fn test_context_clear_narrows_multi_context_read() {
        let cs = changeset();
        cs.clear(&[Some(Resource::iri("urn:g1"))]);
        let dataset = DerivedDataset::new(
            FixtureDataset::boxed(vec![
                stmt("urn:a", Some("urn:g1")),
                stmt("urn:b", Some("urn:g2")),
            ]),
            cs,
        );

        let pattern = StatementPattern::any().in_contexts(vec![
            Some(Resource::iri("urn:g1")),
            Some(Resource::iri("urn:g2")),
        ]);
        assert_eq!(
            collect_all(dataset.statements(&pattern).unwrap()).unwrap(),
            vec![stmt("urn:b", Some("urn:g2"))]
        );
    }

    #[test]
    fn test_namespace_overlay() {
        let cs = changeset();
        cs.set_namespace("ex", "http://example.org/v2/");
        cs.remove_namespace("gone");
        let dataset = DerivedDataset::new(
            FixtureDataset::with_namespaces(
                vec![],
                vec![
                    ("ex", "http://example.org/"),
                    ("gone", "http://gone.example/"),
                    ("kept", "http://kept.example/"),
                ],
            ),
            cs,
        );

        assert_eq!(
            dataset.namespace("ex").unwrap(),
            Some("http://example.org/v2/".to_string())
        );
        assert_eq!(dataset.namespace("gone").unwrap(), None);
        assert_eq!(
            dataset.namespace("kept").unwrap(),
            Some("http://kept.example/".to_string())
        );

        let mut all = collect_all(dataset.namespaces().unwrap()).unwrap();
        all.sort();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].prefix(), "ex");
        assert_eq!(all[0].name(), "http://example.org/v2/");
        assert_eq!(all[1].prefix(), "kept");
    }

    #[test]
    fn test_context_ids_overlay() {
        let cs = changeset();
        cs.clear(&[Some(Resource::iri("urn:g1"))]);
        cs.approve(stmt("urn:a", Some("urn:g3")));
        let dataset = DerivedDataset::new(
            FixtureDataset::boxed(vec![
                stmt("urn:a", Some("urn:g1")),
                stmt("urn:b", Some("urn:g2")),
            ]),
            cs,
        );

        let ids = collect_all(dataset.context_ids().unwrap()).unwrap();
        assert_eq!(ids, vec![Resource::iri("urn:g2"), Resource::iri("urn:g3")]);
    }

    #[test]
    fn test_refback_released_on_close() {
        let cs = changeset();
        let dataset = DerivedDataset::new(FixtureDataset::boxed(vec![]), cs.clone());
        assert!(cs.has_refback());
        dataset.close().unwrap();
        assert!(!cs.has_refback());
        // idempotent
        dataset.close().unwrap();
    }

    #[test]
    fn test_refback_released_on_drop() {
        let cs = changeset();
        {
            let _dataset = DerivedDataset::new(FixtureDataset::boxed(vec![]), cs.clone());
            assert!(cs.has_refback());
        }
        assert!(!cs.has_refback());
    }

    #[test]
    fn test_closed_dataset_fails_fast() {
        let cs = changeset();
        let dataset = DerivedDataset::new(FixtureDataset::boxed(vec![]), cs);
        dataset.close().unwrap();
        let err = dataset
            .statements(&StatementPattern::any())
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, StoreError::Closed(_)));
    }

    #[test]
    fn test_observing_dataset_records_reads() {
        let observations = changeset();
        let dataset = ObservingDataset::new(
            FixtureDataset::boxed(vec![stmt("urn:s", None)]),
            observations.clone(),
        );

        let pattern = StatementPattern::new(Some(Resource::iri("urn:s")), None, None);
        collect_all(dataset.statements(&pattern).unwrap()).unwrap();

        // a concurrent write matching the observed pattern now conflicts
        let other = changeset();
        other.deprecate(&stmt("urn:s", None));
        observations.prepend(other);
        assert!(observations.check_conflicts().unwrap_err().is_conflict());
    }
}
