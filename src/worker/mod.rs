//! Reconciliation workers.
//!
//! Each worker thread runs the dequeue/process cycle: claim an item, take
//! the advisory lock for its key, execute the per-entity state machine, and
//! complete or abandon the claim. Every error is caught at the item
//! boundary; only invariant violations are loud.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::error::Transience;
use crate::metrics::{Counter, Metrics};
use crate::model::{
    apply, diff, merge, ChangeNotification, Diff, DiffId, DiffOpId, Document, EntityName,
    ForeignKey, InternalKey, MergePolicy, SourceName, WorkItem,
};
use crate::source::{SourceError, SourceErrorKind, SourceRegistry};
use crate::store::{AbandonOutcome, LeasedItem, Store, StoreError, StoreHandle};

pub mod locks;

pub use locks::{LockGuard, LockKey, LockTable};

const DEQUEUE_WAIT: Duration = Duration::from_millis(500);
const LOCK_BUSY_BACKOFF: Duration = Duration::from_millis(25);
const STORE_BACKOFF_BASE: Duration = Duration::from_millis(100);
const STORE_BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("reconciliation deadline exceeded")]
    DeadlineExceeded,
    #[error("advisory lock busy")]
    LockBusy,
    #[error("shutting down")]
    Interrupted,
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl WorkerError {
    pub fn transience(&self) -> Transience {
        match self {
            WorkerError::Store(e) => e.transience(),
            WorkerError::Source(e) => e.transience(),
            WorkerError::DeadlineExceeded
            | WorkerError::LockBusy
            | WorkerError::Interrupted => Transience::Retryable,
            WorkerError::Invariant(_) => Transience::Permanent,
        }
    }

    fn is_invariant(&self) -> bool {
        matches!(
            self,
            WorkerError::Invariant(_) | WorkerError::Store(StoreError::Invariant(_))
        )
    }
}

/// Shared worker wiring; one clone per worker thread.
#[derive(Clone)]
pub struct WorkerConfig {
    pub registry: Arc<SourceRegistry>,
    pub policy: MergePolicy,
    pub locks: LockTable,
    pub metrics: Metrics,
    pub reconcile_timeout: Duration,
    pub retry_cap: u32,
    pub shutdown: Arc<AtomicBool>,
}

/// Executes the per-entity state machine for one item at a time.
///
/// Also usable standalone (the one-shot binary drives it without a queue).
pub struct Reconciler {
    store: Box<dyn StoreHandle>,
    config: WorkerConfig,
}

impl Reconciler {
    pub fn new(store: Box<dyn StoreHandle>, config: WorkerConfig) -> Self {
        Self { store, config }
    }

    pub fn run(&mut self, item: &WorkItem) -> Result<(), WorkerError> {
        let deadline = Instant::now() + self.config.reconcile_timeout;
        match item {
            WorkItem::Process(notification) => self.process(notification, deadline),
            WorkItem::Apply {
                diff_id,
                diff,
                accepted,
            } => self.apply_resolution(*diff_id, diff, accepted, deadline),
        }
    }

    /// Process(notification): NEW keys go to create; KNOWN keys classify as
    /// vanished or updated from the trigger source's current state.
    fn process(
        &mut self,
        notification: &ChangeNotification,
        deadline: Instant,
    ) -> Result<(), WorkerError> {
        let fk = notification.foreign_key();
        match self.store.lookup_internal(&fk)? {
            Some(key) => {
                let _guard = self.lock(LockKey::Internal(key.clone()))?;
                self.process_known(&fk, &key, deadline)
            }
            None => {
                let _fk_guard = self.lock(LockKey::Foreign(fk.clone()))?;
                // Another worker may have created the key since the first
                // lookup.
                match self.store.lookup_internal(&fk)? {
                    Some(key) => {
                        let _guard = self.lock(LockKey::Internal(key.clone()))?;
                        self.process_known(&fk, &key, deadline)
                    }
                    None => self.create(notification, &fk, deadline),
                }
            }
        }
    }

    fn process_known(
        &mut self,
        fk: &ForeignKey,
        key: &InternalKey,
        deadline: Instant,
    ) -> Result<(), WorkerError> {
        self.checkpoint(deadline)?;
        let current = match self.registry().get(fk) {
            Ok(current) => current,
            Err(err) => {
                self.count_source_error(&err);
                return Err(err.into());
            }
        };
        match current {
            None => self.delete_everywhere(key),
            Some(_) => self.update(key, deadline),
        }
    }

    /// Create: mint the internal key, bind the trigger's foreign key, store
    /// the authoritative document as the initial, and push copies to every
    /// other source. Sources that fail are retried on the next
    /// notification; successes are not rolled back.
    fn create(
        &mut self,
        notification: &ChangeNotification,
        fk: &ForeignKey,
        deadline: Instant,
    ) -> Result<(), WorkerError> {
        self.checkpoint(deadline)?;
        let key = self.store.create_internal_key(&notification.entity)?;
        // Take the internal lock before the mapping becomes visible.
        let _guard = self.lock(LockKey::Internal(key.clone()))?;
        self.store.record_foreign(&key, fk)?;

        let current = match self.registry().get(fk) {
            Ok(current) => current,
            Err(err) => {
                self.count_source_error(&err);
                return Err(err.into());
            }
        };
        let doc = match current {
            Some(doc) => doc,
            None => {
                // Vanished before we could read it; undo the allocation.
                self.store.delete_internal(&key)?;
                return Ok(());
            }
        };
        self.store.put_initial(&key, &doc)?;

        for source in self.sources_for(&notification.entity) {
            if source == notification.source {
                continue;
            }
            self.checkpoint(deadline)?;
            match self.registry().set(&key.entity, &source, None, &doc) {
                Ok(assigned) => self.store.record_foreign(&key, &assigned)?,
                Err(err) => {
                    tracing::warn!(key = %key, "create push to {}/{} failed: {err}", err.entity, err.source);
                    self.count_source_error(&err);
                }
            }
        }

        tracing::info!(key = %key, "created from {}", notification.source);
        self.entity_counter(&key, "creates").incr();
        Ok(())
    }

    /// Update: refetch every copy, diff each against the remembered initial,
    /// merge, and either propagate the accepted diff everywhere or park the
    /// conflict without touching the sources.
    fn update(&mut self, key: &InternalKey, deadline: Instant) -> Result<(), WorkerError> {
        let sources = self.sources_for(&key.entity);
        if sources.is_empty() {
            return Err(WorkerError::Invariant(format!(
                "no sources configured for entity {}",
                key.entity
            )));
        }

        let mut docs: Vec<(SourceName, Document)> = Vec::new();
        for source in &sources {
            self.checkpoint(deadline)?;
            let Some(fk) = self.store.lookup_foreign(key, source)? else {
                continue;
            };
            match self.registry().get(&fk) {
                Ok(Some(doc)) => docs.push((source.clone(), doc)),
                Ok(None) => {}
                Err(err) => {
                    // Unreadable copies sit this round out.
                    tracing::warn!(key = %key, "skipping {}/{}: {err}", err.entity, err.source);
                    self.count_source_error(&err);
                }
            }
        }

        let stored_initial = self.store.get_initial(key)?;
        let initial = match &stored_initial {
            Some(doc) => doc.clone(),
            // Bootstrap: fall back to the first available copy.
            None => match docs.first() {
                Some((_, doc)) => doc.clone(),
                None => return Ok(()),
            },
        };

        let diffs: Vec<Diff<SourceName>> = docs
            .iter()
            .map(|(source, doc)| diff(&initial, doc).labelled(source.clone()))
            .collect();
        let outcome = merge(&self.config.policy, &initial, &diffs);

        if outcome.has_conflicts() {
            let mut ops = Vec::with_capacity(outcome.accepted.ops.len());
            for op in &outcome.accepted.ops {
                ops.push((op.clone(), true));
            }
            for rejected in &outcome.rejected {
                for op in &rejected.ops {
                    ops.push((op.clone().void(), false));
                }
            }
            let diff_id = self.store.put_diff(key, &ops)?;
            tracing::info!(key = %key, diff_id = %diff_id, "conflict parked");
            self.entity_counter(key, "conflicts").incr();
            return Ok(());
        }

        if outcome.accepted.is_empty() {
            if stored_initial.is_none() {
                self.store.put_initial(key, &initial)?;
            }
            return Ok(());
        }

        let next = apply(&outcome.accepted, &initial);
        self.push_everywhere(key, &sources, &next, deadline)?;
        self.store.put_initial(key, &next)?;
        self.entity_counter(key, "updates").incr();
        Ok(())
    }

    /// Delete: drop every bound copy, then purge the internal key.
    fn delete_everywhere(&mut self, key: &InternalKey) -> Result<(), WorkerError> {
        for source in self.sources_for(&key.entity) {
            if let Some(fk) = self.store.lookup_foreign(key, &source)? {
                if let Err(err) = self.registry().delete(&fk) {
                    self.count_source_error(&err);
                    return Err(err.into());
                }
            }
        }
        let removed = self.store.delete_internal(key)?;
        tracing::info!(key = %key, removed, "internal key purged");
        self.entity_counter(key, "deletes").incr();
        Ok(())
    }

    /// Apply(diff_id, diff): replay a resolution onto the initial document,
    /// push the result everywhere, and close the conflict.
    fn apply_resolution(
        &mut self,
        diff_id: DiffId,
        resolution: &Diff<()>,
        accepted: &[DiffOpId],
        deadline: Instant,
    ) -> Result<(), WorkerError> {
        let Some(key) = self.store.diff_owner(diff_id)? else {
            tracing::warn!(diff_id = %diff_id, "apply for a purged diff dropped");
            return Ok(());
        };
        let _guard = self.lock(LockKey::Internal(key.clone()))?;

        let initial = self.store.get_initial(&key)?.unwrap_or_default();
        let next = apply(resolution, &initial);
        let sources = self.sources_for(&key.entity);
        self.push_everywhere(&key, &sources, &next, deadline)?;
        self.store.put_initial(&key, &next)?;

        match self.store.mark_resolved(diff_id, accepted) {
            // A lost lease can race a redelivered apply; the sources are
            // converged either way.
            Ok(()) | Err(StoreError::ConflictResolved(_)) => {}
            Err(err) => return Err(err.into()),
        }
        self.entity_counter(&key, "resolutions").incr();
        Ok(())
    }

    fn push_everywhere(
        &mut self,
        key: &InternalKey,
        sources: &[SourceName],
        doc: &Document,
        deadline: Instant,
    ) -> Result<(), WorkerError> {
        for source in sources {
            self.checkpoint(deadline)?;
            let fk = self.store.lookup_foreign(key, source)?;
            let assigned = match self.registry().set(&key.entity, source, fk.as_ref(), doc) {
                Ok(assigned) => assigned,
                Err(err) => {
                    self.count_source_error(&err);
                    return Err(err.into());
                }
            };
            if fk.is_none() {
                self.store.record_foreign(key, &assigned)?;
            }
        }
        Ok(())
    }

    fn lock(&self, lock_key: LockKey) -> Result<LockGuard, WorkerError> {
        self.config
            .locks
            .try_acquire(lock_key)
            .ok_or(WorkerError::LockBusy)
    }

    /// Shutdown and deadline are observed between state-machine steps.
    fn checkpoint(&self, deadline: Instant) -> Result<(), WorkerError> {
        if self.config.shutdown.load(Ordering::Relaxed) {
            return Err(WorkerError::Interrupted);
        }
        if Instant::now() >= deadline {
            return Err(WorkerError::DeadlineExceeded);
        }
        Ok(())
    }

    fn registry(&self) -> Arc<SourceRegistry> {
        Arc::clone(&self.config.registry)
    }

    fn sources_for(&self, entity: &EntityName) -> Vec<SourceName> {
        self.config.registry.entity_sources(entity).to_vec()
    }

    fn entity_counter(&self, key: &InternalKey, what: &str) -> Counter {
        self.config
            .metrics
            .counter(&format!("entity.{}.{what}", key.entity))
    }

    fn count_source_error(&self, err: &SourceError) {
        self.config
            .metrics
            .counter(&format!("source.{}.{}.errors", err.entity, err.source))
            .incr();
        if matches!(err.kind, SourceErrorKind::Timeout(_)) {
            self.config
                .metrics
                .counter(&format!("source.{}.{}.timeouts", err.entity, err.source))
                .incr();
        }
    }
}

/// Pool of worker threads sharing the queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(store: Arc<dyn Store>, config: WorkerConfig, count: usize) -> Self {
        let handles = (0..count)
            .map(|_| {
                let store = Arc::clone(&store);
                let config = config.clone();
                thread::spawn(move || run_worker(store, config))
            })
            .collect();
        Self { handles }
    }

    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn run_worker(store: Arc<dyn Store>, config: WorkerConfig) {
    let mut backoff = Backoff::new(STORE_BACKOFF_BASE, STORE_BACKOFF_MAX);
    let lease = lease_for(config.reconcile_timeout);
    let depth_gauge = config.metrics.gauge("queue.depth");

    'reconnect: while !config.shutdown.load(Ordering::Relaxed) {
        let handle = match store.handle() {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!("store unavailable: {err}");
                backoff.sleep();
                continue;
            }
        };
        backoff.reset();
        let mut reconciler = Reconciler::new(handle, config.clone());

        while !config.shutdown.load(Ordering::Relaxed) {
            let leased = match reconciler.store.dequeue(DEQUEUE_WAIT, lease) {
                Ok(Some(leased)) => leased,
                Ok(None) => continue,
                Err(err) => {
                    if err.transience().is_retryable() {
                        tracing::warn!("dequeue failed: {err}");
                    } else {
                        tracing::error!("dequeue failed: {err}");
                    }
                    backoff.sleep();
                    continue 'reconnect;
                }
            };
            handle_item(&mut reconciler, leased, &config);
            if let Ok(depth) = reconciler.store.queue_depth() {
                depth_gauge.set(depth as i64);
            }
        }
        break;
    }
}

/// Item boundary: every error is converted into a completed claim, a
/// requeue, or a dead letter.
fn handle_item(reconciler: &mut Reconciler, leased: LeasedItem, config: &WorkerConfig) {
    match reconciler.run(&leased.item) {
        Ok(()) => {
            if let Err(err) = reconciler.store.complete(&leased.lease) {
                tracing::warn!("complete failed: {err}");
            }
        }
        Err(err) => {
            let cap = if err.is_invariant() {
                config.metrics.counter("worker.invariant_failures").incr();
                tracing::error!("invariant violation: {err}");
                // Straight to the dead-letter table.
                1
            } else {
                tracing::warn!("reconciliation failed: {err}");
                config.retry_cap
            };
            match reconciler
                .store
                .abandon(&leased.lease, &err.to_string(), cap)
            {
                Ok(AbandonOutcome::Requeued { attempts }) => {
                    tracing::debug!(attempts, "item requeued");
                }
                Ok(AbandonOutcome::DeadLettered) => {
                    config.metrics.counter("queue.dead_letters").incr();
                    tracing::error!("item dead-lettered: {err}");
                }
                Err(abandon_err) => tracing::warn!("abandon failed: {abandon_err}"),
            }
            if matches!(err, WorkerError::LockBusy) {
                thread::sleep(LOCK_BUSY_BACKOFF);
            }
        }
    }
}

fn lease_for(reconcile_timeout: Duration) -> Duration {
    reconcile_timeout.saturating_mul(2) + Duration::from_secs(30)
}

struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    fn sleep(&mut self) {
        thread::sleep(self.current);
        self.current = (self.current * 2).min(self.max);
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}
