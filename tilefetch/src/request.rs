//! Tile fetch requests and their lifecycle.
//!
//! A request moves through a one-way state machine:
//!
//! ```text
//! Pending ──► InService ──► Completed | Canceled | Failed
//!    │
//!    └──────► Canceled   (cancelled before a worker took it)
//! ```
//!
//! State lives in a single atomic so that the worker claiming a request and
//! a caller cancelling it race on one compare-exchange: whichever wins owns
//! the terminal callback, which therefore fires exactly once.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::DecodeError;
use crate::geo::Envelope;
use crate::priority::{decode_cost, subsample_tier, PriorityKey};
use crate::sink::ResultSink;
use crate::source::{ReadRegion, TileSource};
use crate::telemetry::SchedulerMetrics;
use crate::tile::tile_region;

/// Identifier assigned at submission; lower ids are older.
pub type RequestId = u64;

const STATE_PENDING: u8 = 0;
const STATE_IN_SERVICE: u8 = 1;
const STATE_COMPLETED: u8 = 2;
const STATE_CANCELED: u8 = 3;
const STATE_FAILED: u8 = 4;

/// Lifecycle state of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Waiting in the intake list or a bucket.
    Pending,
    /// A worker is decoding it.
    InService,
    /// Decoded successfully.
    Completed,
    /// Cancelled before or during service.
    Canceled,
    /// The decode failed.
    Failed,
}

impl RequestState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_PENDING => Self::Pending,
            STATE_IN_SERVICE => Self::InService,
            STATE_COMPLETED => Self::Completed,
            STATE_CANCELED => Self::Canceled,
            _ => Self::Failed,
        }
    }

    /// Returns true for completed, canceled and failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Failed)
    }
}

/// How the caller described the pixels it wants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Geometry {
    /// A tile of the source's grid.
    Tile { level: u32, column: u64, row: u64 },
    /// An arbitrary source rectangle and output size.
    Region(ReadRegion),
}

/// Everything needed to submit one fetch.
///
/// # Example
///
/// ```ignore
/// let spec = FetchSpec::tile(source, 3, 12, 40, sink)
///     .with_bounds(Envelope::new(9.9, 53.5, 10.1, 53.6))
///     .prefetch(true);
/// let handle = scheduler.submit(spec)?;
/// ```
pub struct FetchSpec {
    source: Arc<dyn TileSource>,
    geometry: Geometry,
    bounds: Envelope,
    prefetch: bool,
    sink: Arc<dyn ResultSink>,
}

impl FetchSpec {
    /// Requests tile `(level, column, row)` of `source`.
    pub fn tile(
        source: Arc<dyn TileSource>,
        level: u32,
        column: u64,
        row: u64,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            source,
            geometry: Geometry::Tile { level, column, row },
            bounds: Envelope::UNKNOWN,
            prefetch: false,
            sink,
        }
    }

    /// Requests an arbitrary region of `source`.
    pub fn region(source: Arc<dyn TileSource>, region: ReadRegion, sink: Arc<dyn ResultSink>) -> Self {
        Self {
            source,
            geometry: Geometry::Region(region),
            bounds: Envelope::UNKNOWN,
            prefetch: false,
            sink,
        }
    }

    /// Sets the geographic bounds used for viewpoint ordering.
    pub fn with_bounds(mut self, bounds: Envelope) -> Self {
        self.bounds = bounds;
        self
    }

    /// Marks the request as a speculative prefetch.
    pub fn prefetch(mut self, prefetch: bool) -> Self {
        self.prefetch = prefetch;
        self
    }
}

impl fmt::Debug for FetchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchSpec")
            .field("source", &self.source.name())
            .field("geometry", &self.geometry)
            .field("bounds", &self.bounds)
            .field("prefetch", &self.prefetch)
            .finish_non_exhaustive()
    }
}

/// Terminal result of servicing a request.
#[derive(Debug)]
pub(crate) enum Outcome {
    Completed,
    Canceled,
    Failed(DecodeError),
}

/// A submitted request, shared between the dispatcher, buckets, workers and
/// the caller's [`RequestHandle`].
pub(crate) struct FetchRequest {
    id: RequestId,
    source: Arc<dyn TileSource>,
    geometry: Geometry,
    region: ReadRegion,
    prefetch: bool,
    cost: f64,
    subsample: f64,
    bounds: Envelope,
    sink: Arc<dyn ResultSink>,
    token: CancellationToken,
    state: AtomicU8,
    abort_sent: AtomicBool,
    metrics: Arc<SchedulerMetrics>,
    created_at: Instant,
}

impl FetchRequest {
    /// Resolves the spec's geometry and computes cost and resolution tier.
    pub(crate) fn new(id: RequestId, spec: FetchSpec, metrics: Arc<SchedulerMetrics>) -> Self {
        let FetchSpec {
            source,
            geometry,
            bounds,
            prefetch,
            sink,
        } = spec;

        let region = match geometry {
            Geometry::Tile { level, column, row } => tile_region(source.as_ref(), level, column, row),
            Geometry::Region(region) => region,
        };
        let cost = decode_cost(&region, source.is_multi_resolution());
        let subsample = subsample_tier(&region);

        Self {
            id,
            source,
            geometry,
            region,
            prefetch,
            cost,
            subsample,
            bounds,
            sink,
            token: CancellationToken::new(),
            state: AtomicU8::new(STATE_PENDING),
            abort_sent: AtomicBool::new(false),
            metrics,
            created_at: Instant::now(),
        }
    }

    pub(crate) fn id(&self) -> RequestId {
        self.id
    }

    pub(crate) fn source(&self) -> &dyn TileSource {
        self.source.as_ref()
    }

    pub(crate) fn region(&self) -> &ReadRegion {
        &self.region
    }

    pub(crate) fn is_prefetch(&self) -> bool {
        self.prefetch
    }

    pub(crate) fn cost(&self) -> f64 {
        self.cost
    }

    pub(crate) fn sink(&self) -> &dyn ResultSink {
        self.sink.as_ref()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    /// How long ago the request was created.
    pub(crate) fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn priority_key(&self) -> PriorityKey {
        PriorityKey {
            id: self.id,
            cost: self.cost,
            subsample: self.subsample,
            bounds: self.bounds,
        }
    }

    pub(crate) fn state(&self) -> RequestState {
        RequestState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Pending and not cancelled: eligible to stay queued.
    pub(crate) fn is_live(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_PENDING && !self.token.is_cancelled()
    }

    /// Returns true if `source` is the source that created this request.
    pub(crate) fn is_owned_by(&self, source: &dyn TileSource) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.source), std::ptr::from_ref(source))
    }

    /// Claims the request for a worker.
    ///
    /// Fails if it was cancelled or already claimed, in which case the
    /// worker must discard it without executing.
    pub(crate) fn try_begin_service(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.state
            .compare_exchange(
                STATE_PENDING,
                STATE_IN_SERVICE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Records the terminal outcome of a serviced request and fires its
    /// terminal callback. Only the worker that claimed the request calls this.
    pub(crate) fn finish(&self, outcome: Outcome) {
        let terminal = match &outcome {
            Outcome::Completed => STATE_COMPLETED,
            Outcome::Canceled => STATE_CANCELED,
            Outcome::Failed(_) => STATE_FAILED,
        };
        if self
            .state
            .compare_exchange(
                STATE_IN_SERVICE,
                terminal,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        match outcome {
            Outcome::Completed => {
                self.metrics.request_completed();
                self.sink.on_completed(self.id);
            }
            Outcome::Canceled => {
                self.metrics.request_canceled();
                self.sink.on_canceled(self.id);
            }
            Outcome::Failed(error) => {
                self.metrics.request_failed();
                self.sink.on_error(self.id, &error);
            }
        }
    }

    /// Cancels the request. Idempotent; a no-op once terminal.
    ///
    /// A pending request is resolved here and its `on_canceled` fires on the
    /// calling thread. An in-service request also triggers the source's
    /// abort hook; its worker reports the outcome when the decode returns.
    pub(crate) fn cancel(&self) {
        self.token.cancel();

        match self.state.compare_exchange(
            STATE_PENDING,
            STATE_CANCELED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                debug!(request_id = self.id, "Cancelled pending request");
                self.metrics.request_canceled();
                self.sink.on_canceled(self.id);
            }
            Err(STATE_IN_SERVICE) => {
                if !self.abort_sent.swap(true, Ordering::AcqRel) {
                    debug!(
                        request_id = self.id,
                        source = self.source.name(),
                        "Cancelled in-service request, aborting decode"
                    );
                    self.source.abort();
                }
            }
            Err(_) => {}
        }
    }
}

impl fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("id", &self.id)
            .field("source", &self.source.name())
            .field("geometry", &self.geometry)
            .field("region", &self.region)
            .field("prefetch", &self.prefetch)
            .field("cost", &self.cost)
            .field("subsample", &self.subsample)
            .field("state", &self.state())
            .finish()
    }
}

/// The caller's handle to a submitted request.
///
/// Cheap to clone; cancelling through any clone cancels the request.
#[derive(Clone)]
pub struct RequestHandle {
    request: Arc<FetchRequest>,
}

impl RequestHandle {
    pub(crate) fn new(request: Arc<FetchRequest>) -> Self {
        Self { request }
    }

    /// The request id.
    pub fn id(&self) -> RequestId {
        self.request.id
    }

    /// Cancels the request.
    ///
    /// Safe to call from any thread at any time, any number of times.
    pub fn cancel(&self) {
        self.request.cancel();
    }

    /// Returns true once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.request.token.is_cancelled()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RequestState {
        self.request.state()
    }

    /// Whether the request was submitted as a prefetch.
    pub fn is_prefetch(&self) -> bool {
        self.request.prefetch
    }

    /// Quantized decode cost.
    pub fn cost(&self) -> f64 {
        self.request.cost
    }

    /// Resolution tier (subsample factor).
    pub fn subsample(&self) -> f64 {
        self.request.subsample
    }

    /// The resolved source rectangle and output size.
    pub fn region(&self) -> ReadRegion {
        self.request.region
    }

    /// The geometry as submitted.
    pub fn geometry(&self) -> Geometry {
        self.request.geometry
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RequestHandle").field(&self.request).finish()
    }
}
