//! Store facade
//!
//! A [`Store`] owns two independently branchable sources, one for explicit
//! statements and one for inferred ones, plus a shared value factory and an
//! evaluation-statistics provider for the query optimizer. [`SnapshotStore`]
//! is the standard assembly: one long-lived auto-flushing branch per side,
//! so data written through a store-level sink becomes visible to new
//! datasets without the caller ever calling `flush` on the branch.

use crate::branch::SourceBranch;
use crate::error::Result;
use crate::isolation::IsolationLevel;
use crate::iter::ClosableIter;
use crate::source::{Branch, DelegatingBranch, Source};
use crate::union::UnionBranch;
use std::sync::Arc;
use tessera_db_model::{ModelFactory, StatementPattern, ValueFactory};

/// Cardinality estimates consumed by a query optimizer
///
/// Estimates must reflect the union of explicit and inferred data.
pub trait EvaluationStatistics: Send + Sync {
    /// Estimated number of statements matching the pattern
    fn cardinality(&self, pattern: &StatementPattern) -> Result<f64>;
}

/// Two-sided statement store: explicit and inferred statements, each
/// independently branchable
pub trait Store: Send + Sync {
    /// Shared value factory
    fn value_factory(&self) -> &Arc<ValueFactory>;

    /// The explicit-statement source. Closing the returned handle releases
    /// only the handle, not the store's long-lived branch.
    fn explicit_source(&self) -> Box<dyn Branch>;

    /// The inferred-statement source
    fn inferred_source(&self) -> Box<dyn Branch>;

    /// Both sides as one readable graph; sinks target the explicit side
    fn union_source(&self) -> Box<dyn Branch>;

    /// Statistics over the union of both sides
    fn statistics(&self) -> Box<dyn EvaluationStatistics>;

    /// Release both branches and the backing sources. Idempotent.
    fn close(&self) -> Result<()>;
}

/// Standard store assembly over two backing branches
///
/// Each side gets an auto-flushing [`SourceBranch`]: whenever a side goes
/// idle with merged changes buffered, the branch publishes them to its
/// backing source on its own.
pub struct SnapshotStore {
    value_factory: Arc<ValueFactory>,
    explicit: SourceBranch,
    inferred: SourceBranch,
}

impl SnapshotStore {
    /// Assemble a store over backing branches for the explicit and inferred
    /// sides
    pub fn new(
        explicit: Box<dyn Branch>,
        inferred: Box<dyn Branch>,
        factory: Arc<dyn ModelFactory>,
    ) -> Self {
        SnapshotStore {
            value_factory: Arc::new(ValueFactory::new()),
            explicit: SourceBranch::auto_flushing(explicit, factory.clone()),
            inferred: SourceBranch::auto_flushing(inferred, factory),
        }
    }

    fn handle(branch: &SourceBranch) -> Box<dyn Branch> {
        let shared: Arc<dyn Branch> = Arc::new(branch.clone());
        Box::new(DelegatingBranch::new(shared, false))
    }
}

impl Store for SnapshotStore {
    fn value_factory(&self) -> &Arc<ValueFactory> {
        &self.value_factory
    }

    fn explicit_source(&self) -> Box<dyn Branch> {
        Self::handle(&self.explicit)
    }

    fn inferred_source(&self) -> Box<dyn Branch> {
        Self::handle(&self.inferred)
    }

    fn union_source(&self) -> Box<dyn Branch> {
        Box::new(UnionBranch::new(
            Self::handle(&self.explicit),
            Self::handle(&self.inferred),
        ))
    }

    fn statistics(&self) -> Box<dyn EvaluationStatistics> {
        Box::new(UnionStatistics {
            explicit: self.explicit.clone(),
            inferred: self.inferred.clone(),
        })
    }

    fn close(&self) -> Result<()> {
        // release both sides even when one fails; first error wins
        let explicit = self.explicit.close();
        let inferred = self.inferred.close();
        explicit.and(inferred)
    }
}

/// Counts matching statements across both sides
///
/// Exact rather than estimated; backing stores with native statistics can
/// provide their own [`EvaluationStatistics`] instead.
struct UnionStatistics {
    explicit: SourceBranch,
    inferred: SourceBranch,
}

impl EvaluationStatistics for UnionStatistics {
    fn cardinality(&self, pattern: &StatementPattern) -> Result<f64> {
        let mut count = 0usize;
        for branch in [&self.explicit, &self.inferred] {
            let dataset = branch.dataset(IsolationLevel::SnapshotRead)?;
            let mut matches = dataset.statements(pattern)?;
            while matches.next()?.is_some() {
                count += 1;
            }
            matches.close()?;
            dataset.close()?;
        }
        Ok(count as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::ChangeBatch;
    use crate::error::StoreError;
    use crate::iter::{collect_all, BoxIter, VecCursor};
    use crate::source::{BackingSource, BackingStore, Dataset, Sink};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicIsize, Ordering};
    use tessera_db_model::{Iri, Namespace, Resource, Statement, TreeModelFactory, Value};

    /// Flat store counting open snapshots, for release-discipline checks
    #[derive(Default)]
    struct CountingStore {
        statements: Mutex<Vec<Statement>>,
        open_datasets: Arc<AtomicIsize>,
    }

    struct CountingSnapshot {
        statements: Vec<Statement>,
        open_datasets: Arc<AtomicIsize>,
    }

    impl Dataset for CountingSnapshot {
        fn statements(&self, pattern: &StatementPattern) -> Result<BoxIter<Statement>> {
            Ok(VecCursor::boxed(
                self.statements
                    .iter()
                    .filter(|s| pattern.matches(s))
                    .cloned()
                    .collect(),
            ))
        }

        fn namespace(&self, _prefix: &str) -> Result<Option<String>> {
            Ok(None)
        }

        fn namespaces(&self) -> Result<BoxIter<Namespace>> {
            Ok(VecCursor::boxed(Vec::new()))
        }

        fn context_ids(&self) -> Result<BoxIter<Resource>> {
            Ok(VecCursor::boxed(Vec::new()))
        }

        fn close(&self) -> Result<()> {
            self.open_datasets.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl BackingStore for CountingStore {
        fn supported_levels(&self) -> &[IsolationLevel] {
            &IsolationLevel::ALL
        }

        fn dataset(&self) -> Result<Box<dyn Dataset>> {
            self.open_datasets.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingSnapshot {
                statements: self.statements.lock().clone(),
                open_datasets: self.open_datasets.clone(),
            }))
        }

        fn apply(&self, batch: &ChangeBatch) -> Result<()> {
            let mut statements = self.statements.lock();
            if batch.statement_cleared {
                statements.clear();
            }
            statements.retain(|s| !batch.deprecated.contains(s));
            statements.extend(batch.approved.iter().cloned());
            Ok(())
        }
    }

    /// Branch whose close always fails
    struct BrokenClose;

    impl Source for BrokenClose {
        fn fork(&self) -> Box<dyn Branch> {
            Box::new(BrokenClose)
        }

        fn dataset(&self, _level: IsolationLevel) -> Result<Box<dyn Dataset>> {
            Err(StoreError::storage("backing gone"))
        }

        fn sink(&self, _level: IsolationLevel) -> Result<Box<dyn Sink>> {
            Err(StoreError::storage("backing gone"))
        }

        fn close(&self) -> Result<()> {
            Err(StoreError::storage("close failed"))
        }
    }

    impl Branch for BrokenClose {
        fn prepare(&self) -> Result<()> {
            Ok(())
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    fn stmt(s: &str) -> Statement {
        Statement::new(Resource::iri(s), Iri::new("urn:p"), Value::iri("urn:o"))
    }

    fn store() -> (SnapshotStore, Arc<CountingStore>, Arc<CountingStore>) {
        let explicit = Arc::new(CountingStore::default());
        let inferred = Arc::new(CountingStore::default());
        let factory: Arc<dyn ModelFactory> = Arc::new(TreeModelFactory);
        let snapshot = SnapshotStore::new(
            Box::new(BackingSource::new(explicit.clone(), factory.clone())),
            Box::new(BackingSource::new(inferred.clone(), factory.clone())),
            factory,
        );
        (snapshot, explicit, inferred)
    }

    #[test]
    fn test_writes_visible_without_explicit_branch_flush() {
        let (snapshot, explicit, _) = store();
        let source = snapshot.explicit_source();

        let mut sink = source.sink(IsolationLevel::ReadCommitted).unwrap();
        sink.approve(stmt("urn:a")).unwrap();
        sink.flush().unwrap();
        sink.close().unwrap();

        // the auto-flushing branch published on idle
        assert_eq!(explicit.statements.lock().clone(), vec![stmt("urn:a")]);

        let dataset = source.dataset(IsolationLevel::Snapshot).unwrap();
        let all = collect_all(dataset.statements(&StatementPattern::any()).unwrap()).unwrap();
        assert_eq!(all, vec![stmt("urn:a")]);
        dataset.close().unwrap();

        // closing the handle leaves the long-lived branch usable
        source.close().unwrap();
        let source = snapshot.explicit_source();
        let dataset = source.dataset(IsolationLevel::Snapshot).unwrap();
        dataset.close().unwrap();
    }

    #[test]
    fn test_union_source_reads_both_sides() {
        let (snapshot, _, _) = store();

        let mut sink = snapshot
            .explicit_source()
            .sink(IsolationLevel::ReadCommitted)
            .unwrap();
        sink.approve(stmt("urn:explicit")).unwrap();
        sink.flush().unwrap();
        sink.close().unwrap();

        let mut sink = snapshot
            .inferred_source()
            .sink(IsolationLevel::ReadCommitted)
            .unwrap();
        sink.approve(stmt("urn:inferred")).unwrap();
        sink.flush().unwrap();
        sink.close().unwrap();

        let union = snapshot.union_source();
        let dataset = union.dataset(IsolationLevel::Snapshot).unwrap();
        let all = collect_all(dataset.statements(&StatementPattern::any()).unwrap()).unwrap();
        assert_eq!(all, vec![stmt("urn:explicit"), stmt("urn:inferred")]);
        dataset.close().unwrap();
        union.close().unwrap();
    }

    #[test]
    fn test_statistics_count_union() {
        let (snapshot, _, _) = store();

        for (side, name) in [
            (snapshot.explicit_source(), "urn:a"),
            (snapshot.inferred_source(), "urn:b"),
        ] {
            let mut sink = side.sink(IsolationLevel::ReadCommitted).unwrap();
            sink.approve(stmt(name)).unwrap();
            sink.flush().unwrap();
            sink.close().unwrap();
        }

        let statistics = snapshot.statistics();
        assert_eq!(
            statistics.cardinality(&StatementPattern::any()).unwrap(),
            2.0
        );
        assert_eq!(
            statistics
                .cardinality(&StatementPattern::new(Some(Resource::iri("urn:a")), None, None))
                .unwrap(),
            1.0
        );
    }

    #[test]
    fn test_idempotent_close_releases_once() {
        let (snapshot, explicit, _) = store();
        let source = snapshot.explicit_source();

        // read-committed views own their backing snapshot outright
        let dataset = source.dataset(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(explicit.open_datasets.load(Ordering::SeqCst), 1);
        dataset.close().unwrap();
        dataset.close().unwrap();
        // double close must not double-release
        assert_eq!(explicit.open_datasets.load(Ordering::SeqCst), 0);

        // snapshot views share a snapshot the branch keeps pinned
        let dataset = source.dataset(IsolationLevel::Snapshot).unwrap();
        assert_eq!(explicit.open_datasets.load(Ordering::SeqCst), 1);
        dataset.close().unwrap();
        dataset.close().unwrap();
        assert_eq!(explicit.open_datasets.load(Ordering::SeqCst), 1);

        let mut sink = source.sink(IsolationLevel::ReadCommitted).unwrap();
        sink.close().unwrap();
        sink.close().unwrap();

        // closing the store releases the pinned snapshot, exactly once
        source.close().unwrap();
        snapshot.close().unwrap();
        snapshot.close().unwrap();
        assert_eq!(explicit.open_datasets.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_close_releases_both_sides_on_error() {
        let inferred = Arc::new(CountingStore::default());
        let factory: Arc<dyn ModelFactory> = Arc::new(TreeModelFactory);
        let snapshot = SnapshotStore::new(
            Box::new(BrokenClose),
            Box::new(BackingSource::new(inferred.clone(), factory.clone())),
            factory,
        );

        let source = snapshot.inferred_source();
        let dataset = source.dataset(IsolationLevel::Snapshot).unwrap();
        dataset.close().unwrap();
        source.close().unwrap();
        assert_eq!(inferred.open_datasets.load(Ordering::SeqCst), 1);

        // the explicit side fails to close; the inferred side is still
        // released and its pinned snapshot dropped
        assert!(snapshot.close().is_err());
        assert_eq!(inferred.open_datasets.load(Ordering::SeqCst), 0);
    }
}
