//! The tile fetch scheduler.
//!
//! [`Scheduler`] owns the intake list, the priority buckets, one coordination
//! thread and a fixed pool of workers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Scheduler                              │
//! │                                                                  │
//! │  submit() ──► Intake ──► Dispatcher ──► Buckets ──► Worker 0..N  │
//! │                  ▲         (re-sort)     (cost ×       │         │
//! │  set_viewpoint() ┘                        prefetch)    ▼         │
//! │                                                  TileSource      │
//! │  cancel_all() ─► Intake + Buckets + in-service slots             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Threads are started on first submission and live until shutdown. Each
//! dispatcher cycle drains the intake and every bucket, snapshots the
//! viewpoint, partitions the live requests and sorts each bucket so its tail
//! is the next request to run.
//!
//! # Locking
//!
//! The intake lock is always taken before the bucket lock. The dispatcher
//! keeps the bucket lock from the moment it empties the intake until it has
//! published, so [`Scheduler::cancel_all`] always finds every pending request
//! in either the intake or a bucket. Sink callbacks never run under either
//! lock.

use std::iter;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::bucket::{BucketLoad, BucketSet};
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::geo::GeoPoint;
use crate::priority::PriorityComparator;
use crate::request::{FetchRequest, FetchSpec, RequestHandle, RequestId};
use crate::source::TileSource;
use crate::telemetry::{MetricsSnapshot, SchedulerMetrics};
use crate::worker;

// =============================================================================
// Shared State
// =============================================================================

/// Requests waiting for the next dispatcher cycle.
#[derive(Debug, Default)]
pub(crate) struct Intake {
    pending: Vec<Arc<FetchRequest>>,
    /// Set by viewpoint changes; forces a re-sort even with nothing new.
    resort: bool,
    /// Flush epochs: bumped by `flush()`, acknowledged after publishing.
    requested: u64,
    published: u64,
    shutdown: bool,
}

impl Intake {
    fn has_work(&self) -> bool {
        !self.pending.is_empty() || self.resort || self.requested > self.published
    }
}

/// The buckets plus what each worker is servicing.
#[derive(Debug)]
pub(crate) struct BucketState {
    pub(crate) set: BucketSet,
    /// One slot per worker; `Some` while that worker runs a request.
    pub(crate) servicing: Vec<Option<Arc<FetchRequest>>>,
    pub(crate) shutdown: bool,
}

/// State shared between the scheduler handle and its threads.
pub(crate) struct Shared {
    intake: Mutex<Intake>,
    /// Wakes the dispatcher.
    intake_ready: Condvar,
    /// Wakes `flush()` callers after a publish.
    published: Condvar,
    pub(crate) buckets: Mutex<BucketState>,
    /// Wakes workers after a publish or on shutdown.
    pub(crate) work_ready: Condvar,
    viewpoint: RwLock<Option<GeoPoint>>,
    pub(crate) metrics: Arc<SchedulerMetrics>,
}

impl Shared {
    /// Stops intake and cancels everything still queued.
    ///
    /// Used when the dispatcher dies: later submissions are rejected, flush
    /// callers are released and workers exit after their current request.
    fn halt(&self) -> usize {
        let queued = {
            let mut intake = self.intake.lock();
            intake.shutdown = true;
            let mut queued = std::mem::take(&mut intake.pending);
            let mut buckets = self.buckets.lock();
            buckets.shutdown = true;
            buckets.set.drain_live_into(&mut queued);
            queued
        };
        self.intake_ready.notify_all();
        self.published.notify_all();
        self.work_ready.notify_all();

        let mut canceled = 0;
        for request in &queued {
            if request.is_live() {
                request.cancel();
                canceled += 1;
            }
        }
        canceled
    }
}

// =============================================================================
// Scheduler
// =============================================================================

#[derive(Debug, Default)]
struct Threads {
    started: bool,
    handles: Vec<JoinHandle<()>>,
}

/// Priority-ordered tile fetch scheduler.
///
/// Explicitly constructed and owned; dropping it shuts it down.
///
/// # Example
///
/// ```ignore
/// let scheduler = Scheduler::with_defaults()?;
/// let (sink, mut events) = ChannelSink::new();
/// let handle = scheduler.submit(FetchSpec::tile(source, 0, 3, 4, Arc::new(sink)))?;
/// ```
pub struct Scheduler {
    shared: Arc<Shared>,
    config: SchedulerConfig,
    threads: Mutex<Threads>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

impl Scheduler {
    /// Creates a scheduler. No threads are started until the first submission.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;

        let shared = Arc::new(Shared {
            intake: Mutex::new(Intake::default()),
            intake_ready: Condvar::new(),
            published: Condvar::new(),
            buckets: Mutex::new(BucketState {
                set: BucketSet::new(&config.bucket_ceilings),
                servicing: vec![None; config.worker_count()],
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            viewpoint: RwLock::new(None),
            metrics: Arc::new(SchedulerMetrics::new()),
        });

        debug!(
            buckets = config.bucket_count(),
            workers = config.worker_count(),
            "Tile scheduler created"
        );

        Ok(Self {
            shared,
            config,
            threads: Mutex::new(Threads::default()),
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Creates a scheduler with the default configuration.
    pub fn with_defaults() -> Result<Self, SchedulerError> {
        Self::new(SchedulerConfig::default())
    }

    /// The configuration this scheduler was built with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Submits one request.
    pub fn submit(&self, spec: FetchSpec) -> Result<RequestHandle, SchedulerError> {
        let mut handles = self.submit_all(iter::once(spec))?;
        handles.pop().ok_or(SchedulerError::ShutDown)
    }

    /// Submits several requests at once.
    ///
    /// They enter the intake together, so the dispatcher partitions and sorts
    /// them in the same cycle.
    pub fn submit_all<I>(&self, specs: I) -> Result<Vec<RequestHandle>, SchedulerError>
    where
        I: IntoIterator<Item = FetchSpec>,
    {
        if self.is_shut_down() {
            return Err(SchedulerError::ShutDown);
        }
        self.ensure_started()?;

        let requests: Vec<Arc<FetchRequest>> = specs
            .into_iter()
            .map(|spec| {
                Arc::new(FetchRequest::new(
                    self.next_id(),
                    spec,
                    Arc::clone(&self.shared.metrics),
                ))
            })
            .collect();
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        {
            let mut intake = self.shared.intake.lock();
            if intake.shutdown {
                return Err(SchedulerError::ShutDown);
            }
            for request in &requests {
                self.shared.metrics.request_submitted();
                trace!(
                    request_id = request.id(),
                    cost = request.cost(),
                    prefetch = request.is_prefetch(),
                    "Request submitted"
                );
            }
            intake.pending.extend(requests.iter().cloned());
            self.shared.intake_ready.notify_one();
        }

        Ok(requests.into_iter().map(RequestHandle::new).collect())
    }

    /// Updates the viewpoint and triggers a re-sort of everything pending.
    pub fn set_viewpoint(&self, viewpoint: GeoPoint) {
        self.store_viewpoint(Some(viewpoint));
    }

    /// Removes the viewpoint; ordering falls back to cost, tier and age.
    pub fn clear_viewpoint(&self) {
        self.store_viewpoint(None);
    }

    fn store_viewpoint(&self, viewpoint: Option<GeoPoint>) {
        *self.shared.viewpoint.write() = viewpoint;
        debug!(?viewpoint, "Viewpoint updated");

        let mut intake = self.shared.intake.lock();
        intake.resort = true;
        self.shared.intake_ready.notify_one();
    }

    /// The current viewpoint.
    pub fn viewpoint(&self) -> Option<GeoPoint> {
        *self.shared.viewpoint.read()
    }

    /// Cancels every pending and in-service request.
    ///
    /// Returns the number of requests that were still live.
    pub fn cancel_all(&self) -> usize {
        self.cancel_matching(None)
    }

    /// Cancels every pending and in-service request created for `source`.
    pub fn cancel_source(&self, source: &dyn TileSource) -> usize {
        self.cancel_matching(Some(source))
    }

    fn cancel_matching(&self, owner: Option<&dyn TileSource>) -> usize {
        let matched: Vec<Arc<FetchRequest>> = {
            let intake = self.shared.intake.lock();
            let buckets = self.shared.buckets.lock();

            let queued = buckets.set.iter().flat_map(|bucket| bucket.iter());
            let servicing = buckets.servicing.iter().flatten();
            intake
                .pending
                .iter()
                .chain(queued)
                .chain(servicing)
                .filter(|request| !request.state().is_terminal())
                .filter(|request| owner.map_or(true, |source| request.is_owned_by(source)))
                .cloned()
                .collect()
        };

        for request in &matched {
            request.cancel();
        }

        if !matched.is_empty() {
            debug!(
                count = matched.len(),
                source = owner.map(|source| source.name()),
                "Cancelled requests"
            );
        }
        matched.len()
    }

    /// Blocks until every submission and viewpoint change made before this
    /// call has been published to the buckets.
    ///
    /// Returns immediately if the scheduler never started or is shut down.
    pub fn flush(&self) {
        if !self.threads.lock().started {
            return;
        }

        let mut intake = self.shared.intake.lock();
        if intake.shutdown {
            return;
        }
        intake.requested += 1;
        let target = intake.requested;
        self.shared.intake_ready.notify_one();

        while intake.published < target && !intake.shutdown {
            self.shared.published.wait(&mut intake);
        }
    }

    /// Pending requests per bucket, as of the last publish.
    ///
    /// Cancelled requests are counted until a worker or the next cycle
    /// removes them.
    pub fn pending_counts(&self) -> Vec<BucketLoad> {
        self.shared.buckets.lock().set.loads()
    }

    /// Point-in-time copy of the scheduler counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Returns true once [`Scheduler::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stops the scheduler. Irreversible.
    ///
    /// Every pending request is cancelled. Requests already being decoded
    /// are cancelled too, and their workers report the outcome before
    /// exiting. Blocks until all scheduler threads have stopped, unless
    /// called from one of them.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Tile scheduler shutting down");

        {
            let mut intake = self.shared.intake.lock();
            intake.shutdown = true;
            let mut buckets = self.shared.buckets.lock();
            buckets.shutdown = true;
        }
        self.shared.intake_ready.notify_all();
        self.shared.published.notify_all();
        self.shared.work_ready.notify_all();

        let canceled = self.cancel_all();

        let handles = std::mem::take(&mut self.threads.lock().handles);
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let name = handle.thread().name().map(str::to_owned);
            if handle.join().is_err() {
                warn!(thread = ?name, "Scheduler thread panicked");
            }
        }

        info!(
            canceled,
            metrics = %self.shared.metrics.snapshot(),
            "Tile scheduler stopped"
        );
    }

    fn next_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // =========================================================================
    // Thread Management
    // =========================================================================

    /// Starts the dispatcher and workers on first use.
    fn ensure_started(&self) -> Result<(), SchedulerError> {
        let result = {
            let mut threads = self.threads.lock();
            if threads.started {
                return Ok(());
            }
            if self.is_shut_down() {
                return Err(SchedulerError::ShutDown);
            }
            threads.started = true;
            self.spawn_threads(&mut threads.handles)
        };

        if let Err(error) = &result {
            warn!(error = %error, "Failed to start tile scheduler");
            self.shutdown();
        }
        result
    }

    fn spawn_threads(&self, handles: &mut Vec<JoinHandle<()>>) -> Result<(), SchedulerError> {
        let prefix = &self.config.thread_name_prefix;

        let shared = Arc::clone(&self.shared);
        let dispatcher = thread::Builder::new()
            .name(format!("{}-dispatch", prefix))
            .spawn(move || coordinate(shared))
            .map_err(|source| SchedulerError::Spawn {
                role: "dispatcher",
                source,
            })?;
        handles.push(dispatcher);

        let bindings = self.config.worker_bindings();
        let worker_count = bindings.len();
        for (index, buckets) in bindings.into_iter().enumerate() {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{}", prefix, index))
                .spawn(move || worker::run(shared, index, buckets))
                .map_err(|source| SchedulerError::Spawn {
                    role: "worker",
                    source,
                })?;
            handles.push(handle);
        }

        info!(workers = worker_count, "Tile scheduler started");
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Coordination Loop
// =============================================================================

/// Dispatcher thread body.
///
/// A panic in a cycle halts the scheduler instead of leaving submissions
/// and `flush()` callers waiting on a dead thread.
fn coordinate(shared: Arc<Shared>) {
    debug!("Dispatcher started");

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| coordinate_cycles(&shared))) {
        let canceled = shared.halt();
        error!(
            panic = %worker::panic_message(payload.as_ref()),
            canceled,
            "Dispatcher panicked, tile scheduler halted"
        );
    }

    debug!("Dispatcher stopped");
}

/// Waits for intake activity and re-sorts until shutdown.
fn coordinate_cycles(shared: &Shared) {
    loop {
        let mut intake = shared.intake.lock();
        while !intake.shutdown && !intake.has_work() {
            shared.intake_ready.wait(&mut intake);
        }
        if intake.shutdown {
            break;
        }

        let epoch = intake.requested;
        intake.resort = false;
        let mut working = std::mem::take(&mut intake.pending);
        let submitted = working.len();
        working.retain(|request| request.is_live());
        let mut discarded = submitted - working.len();

        let mut buckets = shared.buckets.lock();
        drop(intake);

        discarded += buckets.set.drain_live_into(&mut working);
        let comparator = PriorityComparator::new(*shared.viewpoint.read());
        let published = working.len();
        let stranded = buckets.set.publish(working, &comparator);
        shared.work_ready.notify_all();
        drop(buckets);

        shared.metrics.requests_discarded(discarded as u64);
        shared.metrics.resort_cycle();
        trace!(
            new = submitted,
            published,
            discarded,
            viewpoint = ?comparator.viewpoint(),
            "Buckets re-sorted"
        );

        // Only reachable with ceilings that leave a cost uncovered
        for request in stranded {
            warn!(request_id = request.id(), cost = request.cost(), "No bucket accepts request");
            request.cancel();
        }

        let mut intake = shared.intake.lock();
        intake.published = intake.published.max(epoch);
        shared.published.notify_all();
    }
}
