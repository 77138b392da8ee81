//! Branch - an ordered stack of flushed changesets over a backing source
//!
//! A [`SourceBranch`] buffers committed-but-unpublished state. Sinks opened
//! on the branch stage into private changesets; a sink `flush` merges its
//! changeset onto the branch head, where new datasets see it layered over a
//! pinned backing snapshot. The branch itself publishes downward with
//! `prepare`/`flush`, applying every merged changeset to a single backing
//! sink so the whole stack lands atomically.
//!
//! ## Locking
//!
//! Two locks with a strict order: `flush_lock` (the merge/flush critical
//! section, held across a prepared sink's prepare-to-close window) is taken
//! before the short `state` mutex. Changeset mutexes come last and are never
//! held across calls into another changeset; views are snapshotted and the
//! lock released before any layered read.
//!
//! ## Compression
//!
//! Merged changesets fold forward: when the two newest entries both have no
//! datasets reading through them, the newest is replayed onto its
//! predecessor. Keeps the read stack shallow under write-heavy loads without
//! pulling state out from under a live reader.

use crate::changeset::{ChangeBatch, Changeset};
use crate::dataset::{DerivedDataset, ObservingDataset};
use crate::error::{Result, StoreError};
use crate::isolation::IsolationLevel;
use crate::iter::BoxIter;
use crate::source::{Branch, Dataset, DelegatingBranch, SharedDataset, Sink, Source};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessera_db_model::{ModelFactory, Namespace, Resource, Statement, StatementPattern};

type FlushGuard = parking_lot::lock_api::ArcMutexGuard<parking_lot::RawMutex, ()>;

/// Replay a batch into a sink, in merge-application order
pub(crate) fn apply_batch_to_sink(sink: &mut dyn Sink, batch: &ChangeBatch) -> Result<()> {
    for pattern in &batch.observed {
        sink.observe(pattern)?;
    }
    if batch.namespace_cleared {
        sink.clear_namespaces()?;
    }
    for prefix in &batch.removed_prefixes {
        sink.remove_namespace(prefix)?;
    }
    for (prefix, name) in &batch.added_namespaces {
        sink.set_namespace(prefix, name)?;
    }
    if batch.statement_cleared {
        sink.clear(&[])?;
    }
    if !batch.deprecated_contexts.is_empty() {
        sink.clear(&batch.deprecated_contexts)?;
    }
    for statement in &batch.deprecated {
        sink.deprecate(statement)?;
    }
    for statement in batch.approved.iter().cloned() {
        sink.approve(statement)?;
    }
    Ok(())
}

/// Replay a batch onto an older changeset, in merge-application order
fn apply_batch_to_changeset(target: &Changeset, batch: ChangeBatch) {
    for pattern in batch.observed {
        target.observe(pattern);
    }
    if batch.namespace_cleared {
        target.clear_namespaces();
    }
    for prefix in &batch.removed_prefixes {
        target.remove_namespace(prefix);
    }
    for (prefix, name) in &batch.added_namespaces {
        target.set_namespace(prefix, name);
    }
    if batch.statement_cleared {
        target.clear(&[]);
    }
    if !batch.deprecated_contexts.is_empty() {
        target.clear(&batch.deprecated_contexts);
    }
    for statement in &batch.deprecated {
        target.deprecate(statement);
    }
    for statement in batch.approved {
        target.approve(statement);
    }
}

#[derive(Default)]
struct BranchState {
    /// Merged changesets, oldest first; the branch head is the whole stack
    changes: Vec<Arc<Changeset>>,
    /// Changesets of open, unflushed sinks
    pending: Vec<Arc<Changeset>>,
    /// Changeset the open serializable sink records into; serializable
    /// datasets observe reads through it
    serializable: Option<Arc<Changeset>>,
    /// Open datasets on this branch
    observers: usize,
    /// Pinned backing snapshot shared by snapshot-or-stronger datasets
    snapshot: Option<Arc<dyn Dataset>>,
    /// Superseded snapshots kept alive for still-open datasets
    retired: Vec<Arc<dyn Dataset>>,
    closed: bool,
}

/// Backing sink prepared ahead of a branch flush, holding the critical
/// section until flush or close
struct PreparedFlush {
    guard: FlushGuard,
    sink: Box<dyn Sink>,
    count: usize,
}

struct BranchInner {
    backing: Box<dyn Branch>,
    factory: Arc<dyn ModelFactory>,
    auto_flush: bool,
    /// Merge/flush critical section; see module docs for lock order
    flush_lock: Arc<Mutex<()>>,
    state: Mutex<BranchState>,
    prepared: Mutex<Option<PreparedFlush>>,
}

/// Buffering branch over a backing source
///
/// Cheap to clone; all clones share one branch.
#[derive(Clone)]
pub struct SourceBranch {
    inner: Arc<BranchInner>,
}

impl SourceBranch {
    /// Create a branch that publishes to the backing source only on explicit
    /// `flush`
    pub fn new(backing: Box<dyn Branch>, factory: Arc<dyn ModelFactory>) -> Self {
        Self::with_auto_flush(backing, factory, false)
    }

    /// Create a branch that additionally flushes itself downward whenever it
    /// goes idle (no open sinks or datasets) with merged changes buffered
    pub fn auto_flushing(backing: Box<dyn Branch>, factory: Arc<dyn ModelFactory>) -> Self {
        Self::with_auto_flush(backing, factory, true)
    }

    fn with_auto_flush(
        backing: Box<dyn Branch>,
        factory: Arc<dyn ModelFactory>,
        auto_flush: bool,
    ) -> Self {
        SourceBranch {
            inner: Arc::new(BranchInner {
                backing,
                factory,
                auto_flush,
                flush_lock: Arc::new(Mutex::new(())),
                state: Mutex::new(BranchState::default()),
                prepared: Mutex::new(None),
            }),
        }
    }

    /// Any merged-but-unpublished changes?
    pub fn has_changes(&self) -> bool {
        !self.inner.state.lock().changes.is_empty()
    }

    #[cfg(test)]
    fn change_count(&self) -> usize {
        self.inner.state.lock().changes.len()
    }
}

impl Source for SourceBranch {
    fn fork(&self) -> Box<dyn Branch> {
        let delegate: Arc<dyn Branch> = Arc::new(self.clone());
        Box::new(SourceBranch::new(
            Box::new(DelegatingBranch::new(delegate, false)),
            self.inner.factory.clone(),
        ))
    }

    fn dataset(&self, level: IsolationLevel) -> Result<Box<dyn Dataset>> {
        let inner = &self.inner;
        let (base, changes, serializable) = {
            let mut state = inner.state.lock();
            if state.closed {
                return Err(StoreError::closed("branch"));
            }
            let base: Box<dyn Dataset> =
                if level.is_compatible_with(IsolationLevel::SnapshotRead) {
                    let snapshot = match &state.snapshot {
                        Some(snapshot) => snapshot.clone(),
                        None => {
                            let snapshot: Arc<dyn Dataset> =
                                Arc::from(inner.backing.dataset(level)?);
                            state.snapshot = Some(snapshot.clone());
                            snapshot
                        }
                    };
                    Box::new(SharedDataset::new(snapshot))
                } else {
                    inner.backing.dataset(level)?
                };
            state.observers += 1;
            (base, state.changes.clone(), state.serializable.clone())
        };

        let mut dataset = base;
        for changeset in &changes {
            dataset = DerivedDataset::boxed(dataset, changeset.clone());
        }

        let mut observations = None;
        if level.is_compatible_with(IsolationLevel::Serializable) {
            let target = match serializable {
                Some(changeset) => changeset,
                None => {
                    // no serializable sink open: record into a standalone
                    // changeset, merged on dataset close so the observations
                    // still propagate downward with the next branch flush
                    let changeset = Arc::new(Changeset::new(inner.factory.clone()));
                    inner.state.lock().pending.push(changeset.clone());
                    observations = Some(changeset.clone());
                    changeset
                }
            };
            dataset = ObservingDataset::boxed(dataset, target);
        }

        Ok(Box::new(BranchDataset {
            inner: dataset,
            branch: inner.clone(),
            observations,
            closed: AtomicBool::new(false),
        }))
    }

    fn sink(&self, level: IsolationLevel) -> Result<Box<dyn Sink>> {
        let changeset = Arc::new(Changeset::new(self.inner.factory.clone()));
        let serializable = level.is_compatible_with(IsolationLevel::Serializable);
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(StoreError::closed("branch"));
            }
            state.pending.push(changeset.clone());
            // serializable datasets observe through the first open
            // serializable sink; later ones only get the prepend-based check
            if serializable && state.serializable.is_none() {
                state.serializable = Some(changeset.clone());
            }
        }
        Ok(Box::new(ChangesetSink {
            branch: self.inner.clone(),
            changeset,
            serializable,
            guard: None,
            closed: false,
        }))
    }

    fn close(&self) -> Result<()> {
        if let Some(prepared) = self.inner.prepared.lock().take() {
            let PreparedFlush { guard, mut sink, .. } = prepared;
            let _ = sink.close();
            drop(guard);
        }
        let (snapshot, retired) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.changes.clear();
            state.pending.clear();
            state.serializable = None;
            (state.snapshot.take(), std::mem::take(&mut state.retired))
        };
        for dataset in retired {
            dataset.close()?;
        }
        if let Some(snapshot) = snapshot {
            snapshot.close()?;
        }
        self.inner.backing.close()
    }
}

impl Branch for SourceBranch {
    fn prepare(&self) -> Result<()> {
        let mut prepared = self.inner.prepared.lock();
        if prepared.is_some() {
            return Ok(());
        }
        let guard = self.inner.flush_lock.lock_arc();
        let (sink, count) = self.inner.open_prepared_sink()?;
        *prepared = Some(PreparedFlush { guard, sink, count });
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let taken = self.inner.prepared.lock().take();
        match taken {
            Some(PreparedFlush { guard, sink, count }) => {
                let result = self.inner.complete_flush(sink, count);
                drop(guard);
                result
            }
            None => {
                let _guard = self.inner.flush_lock.lock();
                if self.inner.state.lock().changes.is_empty() {
                    return Ok(());
                }
                let (sink, count) = self.inner.open_prepared_sink()?;
                self.inner.complete_flush(sink, count)
            }
        }
    }
}

impl BranchInner {
    /// Merge a changeset onto the branch head. Caller holds `flush_lock`.
    ///
    /// The changeset is prepended to every still-pending sibling so their
    /// later conflict checks see it, then appended to `changes`. When
    /// `replacement` is given (a sink flushing mid-life), the fresh changeset
    /// takes over the merged one's pending and serializable registrations.
    fn merge(&self, changeset: &Arc<Changeset>, replacement: Option<&Arc<Changeset>>) {
        let mut state = self.state.lock();
        state.pending.retain(|cs| !Arc::ptr_eq(cs, changeset));
        if changeset.has_changes() {
            tracing::debug!(change = ?changeset, "merging changeset onto branch head");
            for sibling in &state.pending {
                sibling.prepend(changeset.clone());
            }
            state.changes.push(changeset.clone());
        }
        if let Some(fresh) = replacement {
            state.pending.push(fresh.clone());
            let was_serializable = state
                .serializable
                .as_ref()
                .is_some_and(|cs| Arc::ptr_eq(cs, changeset));
            if was_serializable {
                state.serializable = Some(fresh.clone());
            }
        }
        self.compress(&mut state);
    }

    /// Fold the newest merged changeset into its predecessor while neither
    /// has a dataset reading through it. Caller holds `flush_lock`.
    fn compress(&self, state: &mut BranchState) {
        while state.changes.len() > 1 {
            let newest = &state.changes[state.changes.len() - 1];
            let previous = &state.changes[state.changes.len() - 2];
            if newest.has_refback() || previous.has_refback() {
                break;
            }
            let newest = match state.changes.pop() {
                Some(newest) => newest,
                None => break,
            };
            let previous = &state.changes[state.changes.len() - 1];
            tracing::debug!(folded = ?newest, into = ?previous, "compressing change stack");
            apply_batch_to_changeset(previous, newest.to_batch());
        }
    }

    /// Stage every merged changeset into a backing sink and prepare it.
    /// Caller holds `flush_lock`.
    fn open_prepared_sink(&self) -> Result<(Box<dyn Sink>, usize)> {
        let changes = { self.state.lock().changes.clone() };
        let mut sink = self.backing.sink(IsolationLevel::None)?;
        let staged = (|| {
            for change in &changes {
                apply_batch_to_sink(sink.as_mut(), &change.to_batch())?;
            }
            sink.prepare()
        })();
        if let Err(e) = staged {
            let _ = sink.close();
            return Err(e);
        }
        Ok((sink, changes.len()))
    }

    /// Flush a prepared backing sink and unwind the published changesets.
    /// Caller holds `flush_lock`.
    ///
    /// The state lock is held across the backing publish and the drain:
    /// `dataset()` reads the backing and the change stack under that same
    /// lock, so a concurrently opened view sees either the pre-publish
    /// backing with the changesets layered over it or the post-drain
    /// backing, never the published statements twice.
    ///
    /// On flush failure the sink is discarded and `changes` kept, so the
    /// backing source stays untouched and the branch can retry.
    fn complete_flush(&self, mut sink: Box<dyn Sink>, count: usize) -> Result<()> {
        let stale = {
            let mut state = self.state.lock();
            if let Err(e) = sink.flush() {
                drop(state);
                let _ = sink.close();
                return Err(e);
            }
            let published = count.min(state.changes.len());
            state.changes.drain(..published);
            // the pinned snapshot no longer shows the branch base state
            if let Some(snapshot) = state.snapshot.take() {
                state.retired.push(snapshot);
            }
            if state.observers == 0 {
                std::mem::take(&mut state.retired)
            } else {
                Vec::new()
            }
        };
        sink.close()?;
        tracing::debug!(published = count, "branch flushed to backing source");
        for dataset in stale {
            dataset.close()?;
        }
        Ok(())
    }

    /// Called when a branch dataset closes
    fn dataset_closed(&self, observations: Option<&Arc<Changeset>>) -> Result<()> {
        if let Some(observed) = observations {
            let _guard = self.flush_lock.lock();
            self.merge(observed, None);
        } else if let Some(_guard) = self.flush_lock.try_lock() {
            // a reader going away may unblock compression
            let mut state = self.state.lock();
            self.compress(&mut state);
        }
        let stale = {
            let mut state = self.state.lock();
            state.observers = state.observers.saturating_sub(1);
            if state.observers == 0 {
                std::mem::take(&mut state.retired)
            } else {
                Vec::new()
            }
        };
        for dataset in stale {
            dataset.close()?;
        }
        self.maybe_auto_flush();
        Ok(())
    }

    /// Publish downward if enabled, idle, and uncontended
    fn maybe_auto_flush(&self) {
        if !self.auto_flush {
            return;
        }
        let Some(_guard) = self.flush_lock.try_lock() else {
            return;
        };
        let should = {
            let state = self.state.lock();
            !state.closed
                && state.observers == 0
                && state.pending.is_empty()
                && !state.changes.is_empty()
        };
        if !should {
            return;
        }
        let result = self
            .open_prepared_sink()
            .and_then(|(sink, count)| self.complete_flush(sink, count));
        if let Err(e) = result {
            // changes are kept; the next idle point retries
            tracing::warn!(error = %e, "auto-flush failed");
        }
    }
}

/// Sink staging into a private changeset, merged onto the branch at flush
struct ChangesetSink {
    branch: Arc<BranchInner>,
    changeset: Arc<Changeset>,
    serializable: bool,
    guard: Option<FlushGuard>,
    closed: bool,
}

impl ChangesetSink {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(StoreError::closed("sink"))
        } else {
            Ok(())
        }
    }
}

impl Sink for ChangesetSink {
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
        self.ensure_open()?;
        if self.guard.is_none() {
            self.guard = Some(self.branch.flush_lock.lock_arc());
        }
        if let Err(e) = self.changeset.check_conflicts() {
            // release the critical section so the conflicting winner's
            // siblings are not stalled while this transaction aborts
            self.guard = None;
            return Err(e);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.changeset.has_changes() {
            return Ok(());
        }
        let fresh = Arc::new(Changeset::new(self.branch.factory.clone()));
        let branch = self.branch.clone();
        let local_guard = if self.guard.is_none() {
            Some(branch.flush_lock.lock())
        } else {
            None
        };
        branch.merge(&self.changeset, Some(&fresh));
        // the merged changeset now belongs to the branch head; any further
        // writes through this sink start a new one
        self.changeset = fresh;
        drop(local_guard);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        {
            let mut state = self.branch.state.lock();
            state.pending.retain(|cs| !Arc::ptr_eq(cs, &self.changeset));
            let is_ours = state
                .serializable
                .as_ref()
                .is_some_and(|cs| Arc::ptr_eq(cs, &self.changeset));
            if self.serializable && is_ours {
                state.serializable = None;
            }
        }
        self.guard = None;
        self.branch.maybe_auto_flush();
        Ok(())
    }
}

impl Drop for ChangesetSink {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}

/// Observer-counting wrapper handed out by `SourceBranch::dataset`
struct BranchDataset {
    inner: Box<dyn Dataset>,
    branch: Arc<BranchInner>,
    /// Standalone observation changeset for a serializable dataset opened
    /// without a serializable sink; merged at close
    observations: Option<Arc<Changeset>>,
    closed: AtomicBool,
}

impl Dataset for BranchDataset {
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
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.inner.close()?;
            self.branch.dataset_closed(self.observations.as_ref())?;
        }
        Ok(())
    }
}

impl Drop for BranchDataset {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.close();
        }
    }
}
