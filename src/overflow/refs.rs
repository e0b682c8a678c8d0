use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::node::{EvictOutcome, NodeRef};
use crate::storage::{NodeCodec, NodeStore};
use crate::types::{GraphError, Result};

/// Default number of handles evicted per pressure signal.
pub const DEFAULT_EVICTION_BATCH: usize = 100_000;

/// Tracks resident node bodies and evicts them to storage in batches.
///
/// Batches run on a background thread, one at a time. While a batch is in
/// flight, threads creating nodes or edges block in
/// [`ReferenceManager::apply_backpressure`]. A manager built with
/// `enabled = false` ignores registrations and pressure signals and never
/// blocks.
pub struct ReferenceManager {
    enabled: bool,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    batch_size: usize,
    store: Arc<dyn NodeStore>,
    codec: Arc<NodeCodec>,
    state: Mutex<RefState>,
    idle: Condvar,
    counters: RefCounters,
}

#[derive(Default)]
struct RefState {
    clearable: VecDeque<NodeRef>,
    in_flight: bool,
    shut_down: bool,
}

#[derive(Default)]
struct RefCounters {
    batches: AtomicU64,
    evicted: AtomicU64,
    persisted: AtomicU64,
    failures: AtomicU64,
    backpressure_waits: AtomicU64,
}

/// Point-in-time reference manager counters.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RefStats {
    /// Handles currently eligible for eviction.
    pub clearable: usize,
    /// Whether a batch is running.
    pub in_flight: bool,
    /// Batches completed, including synchronous flushes.
    pub batches: u64,
    /// Bodies released.
    pub evicted: u64,
    /// Bodies written to storage before release.
    pub persisted: u64,
    /// Per-handle eviction failures.
    pub failures: u64,
    /// Calls to `apply_backpressure` that had to wait.
    pub backpressure_waits: u64,
}

/// Result of one eviction pass.
#[derive(Default)]
struct BatchReport {
    evicted: usize,
    persisted: usize,
    failed: Vec<NodeRef>,
    first_error: Option<GraphError>,
}

impl BatchReport {
    /// Folds failures into a single [`GraphError::Flush`].
    fn take_failure(&mut self) -> Option<GraphError> {
        let first = self.first_error.take()?;
        Some(GraphError::Flush {
            failed: self.failed.len(),
            first: Box::new(first),
        })
    }
}

impl ReferenceManager {
    /// Builds a manager persisting through `store`.
    pub fn new(
        enabled: bool,
        batch_size: usize,
        store: Arc<dyn NodeStore>,
        codec: Arc<NodeCodec>,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(GraphError::InvalidArgument(
                "eviction batch size must be positive".into(),
            ));
        }
        Ok(Self {
            enabled,
            shared: Arc::new(Shared {
                batch_size,
                store,
                codec,
                state: Mutex::new(RefState::default()),
                idle: Condvar::new(),
                counters: RefCounters::default(),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Whether overflow is active.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Marks a freshly bound handle as clearable.
    pub fn register(&self, handle: NodeRef) {
        if !self.enabled {
            return;
        }
        let mut state = self.shared.state.lock();
        if !state.shut_down {
            state.clearable.push_back(handle);
        }
    }

    /// Number of handles waiting to be evicted.
    pub fn clearable_count(&self) -> usize {
        self.shared.state.lock().clearable.len()
    }

    /// Whether an eviction batch is running.
    pub fn is_in_flight(&self) -> bool {
        self.shared.state.lock().in_flight
    }

    /// Starts an asynchronous batch of up to `batch_size` handles.
    ///
    /// Returns false without doing anything when overflow is disabled, a
    /// batch is already running, or nothing is clearable.
    pub fn on_pressure_signal(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let batch = {
            let mut state = self.shared.state.lock();
            if state.in_flight || state.shut_down || state.clearable.is_empty() {
                return false;
            }
            let take = self.shared.batch_size.min(state.clearable.len());
            let batch: Vec<NodeRef> = state.clearable.drain(..take).collect();
            state.in_flight = true;
            debug!(
                batch = batch.len(),
                remaining = state.clearable.len(),
                "refs.pressure.batch_scheduled"
            );
            batch
        };

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("overgraph-evict".into())
            .spawn(move || {
                let report = shared.evict_batch(batch);
                shared.finish(report, true);
            });
        match spawned {
            Ok(handle) => {
                if let Some(previous) = self.worker.lock().replace(handle) {
                    let _ = previous.join();
                }
                true
            }
            Err(err) => {
                warn!(error = %err, "refs.worker.spawn_failed");
                let mut state = self.shared.state.lock();
                state.in_flight = false;
                self.shared.idle.notify_all();
                false
            }
        }
    }

    /// Blocks while an eviction batch is in flight.
    pub fn apply_backpressure(&self) {
        if !self.enabled {
            return;
        }
        let mut state = self.shared.state.lock();
        if !state.in_flight {
            return;
        }
        self.shared
            .counters
            .backpressure_waits
            .fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        while state.in_flight {
            self.shared.idle.wait(&mut state);
        }
        debug!(
            waited_us = started.elapsed().as_micros() as u64,
            "refs.backpressure.released"
        );
    }

    /// Blocks until no batch is in flight, regardless of `enabled`.
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        while state.in_flight {
            self.shared.idle.wait(&mut state);
        }
    }

    /// Evicts every clearable handle synchronously.
    ///
    /// Handles that fail to persist stay bound and clearable; the first
    /// failure is returned inside [`GraphError::Flush`]. Returns the number
    /// of bodies released.
    pub fn clear_all_references(&self) -> Result<usize> {
        if !self.enabled {
            return Ok(0);
        }
        let batch = self.claim(|state| state.clearable.drain(..).collect());
        let mut report = self.shared.evict_batch(batch);
        let evicted = report.evicted;
        let failure = report.take_failure();
        self.shared.finish(report, true);
        match failure {
            Some(err) => Err(err),
            None => {
                info!(evicted, "refs.clear_all.completed");
                Ok(evicted)
            }
        }
    }

    /// Evicts one handle synchronously, outside the batch cadence.
    pub fn evict(&self, handle: &NodeRef) -> Result<EvictOutcome> {
        self.claim(|state| {
            state.clearable.retain(|queued| queued != handle);
            Vec::new()
        });
        let result = handle.evict(self.shared.store.as_ref(), &self.shared.codec);
        let mut report = BatchReport::default();
        match &result {
            Ok(EvictOutcome::Evicted { persisted }) => {
                report.evicted = 1;
                report.persisted = usize::from(*persisted);
            }
            Ok(_) => {}
            Err(_) => report.failed.push(handle.clone()),
        }
        self.shared.finish(report, self.enabled);
        result
    }

    /// Persists and releases `handles` synchronously without consulting the
    /// clearable queue. Used to flush graphs running with overflow disabled.
    pub(crate) fn flush_handles(&self, handles: Vec<NodeRef>) -> Result<usize> {
        self.claim(|_| Vec::new());
        let mut report = self.shared.evict_batch(handles);
        let evicted = report.evicted;
        let failure = report.take_failure();
        self.shared.finish(report, false);
        failure.map_or(Ok(evicted), Err)
    }

    /// Waits for the running batch, then stops accepting work.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            while state.in_flight {
                self.shared.idle.wait(&mut state);
            }
            state.shut_down = true;
            state.clearable.clear();
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("refs.worker.panicked");
            }
        }
        debug!("refs.shutdown");
    }

    /// Counter snapshot.
    pub fn stats(&self) -> RefStats {
        let (clearable, in_flight) = {
            let state = self.shared.state.lock();
            (state.clearable.len(), state.in_flight)
        };
        let counters = &self.shared.counters;
        RefStats {
            clearable,
            in_flight,
            batches: counters.batches.load(Ordering::Relaxed),
            evicted: counters.evicted.load(Ordering::Relaxed),
            persisted: counters.persisted.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            backpressure_waits: counters.backpressure_waits.load(Ordering::Relaxed),
        }
    }

    /// Waits out any running batch, marks a new one in flight, and lets
    /// `take` pick its handles.
    fn claim(&self, take: impl FnOnce(&mut RefState) -> Vec<NodeRef>) -> Vec<NodeRef> {
        let mut state = self.shared.state.lock();
        while state.in_flight {
            self.shared.idle.wait(&mut state);
        }
        state.in_flight = true;
        take(&mut state)
    }
}

impl Drop for ReferenceManager {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for ReferenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceManager")
            .field("enabled", &self.enabled)
            .field("batch_size", &self.shared.batch_size)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Shared {
    fn evict_batch(&self, batch: Vec<NodeRef>) -> BatchReport {
        let started = Instant::now();
        let total = batch.len();
        let mut report = BatchReport::default();
        for handle in batch {
            match handle.evict(self.store.as_ref(), &self.codec) {
                Ok(EvictOutcome::Evicted { persisted }) => {
                    report.evicted += 1;
                    report.persisted += usize::from(persisted);
                }
                Ok(EvictOutcome::NotResident | EvictOutcome::Removed) => {}
                Err(err) => {
                    warn!(
                        node = %handle.id(),
                        label = handle.label(),
                        error = %err,
                        "refs.evict.failed"
                    );
                    report.failed.push(handle);
                    report.first_error.get_or_insert(err);
                }
            }
        }
        debug!(
            total,
            evicted = report.evicted,
            persisted = report.persisted,
            failed = report.failed.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "refs.evict.batch_completed"
        );
        report
    }

    /// Updates counters, re-queues failures when `requeue`, and releases waiters.
    fn finish(&self, report: BatchReport, requeue: bool) {
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        self.counters
            .evicted
            .fetch_add(report.evicted as u64, Ordering::Relaxed);
        self.counters
            .persisted
            .fetch_add(report.persisted as u64, Ordering::Relaxed);
        self.counters
            .failures
            .fetch_add(report.failed.len() as u64, Ordering::Relaxed);
        let mut state = self.state.lock();
        if requeue && !state.shut_down {
            state.clearable.extend(report.failed);
        }
        state.in_flight = false;
        self.idle.notify_all();
    }
}
