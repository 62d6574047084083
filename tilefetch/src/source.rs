//! Raster source interface consumed by the scheduler.
//!
//! A [`TileSource`] is the format-specific collaborator that turns a source
//! rectangle into pixel bytes. The scheduler only needs its geometry, whether
//! it can produce arbitrary resolutions natively, a blocking `decode`, and a
//! best-effort `abort` hook for requests cancelled mid-decode.
//!
//! # Cancellation
//!
//! Decodes are never preempted. Each decode receives a [`DecodeContext`]
//! carrying the request's cancellation token; long-running decoders should
//! poll [`DecodeContext::is_cancelled`] (or `check_cancelled()?`) between
//! blocks and return [`DecodeError::Cancelled`] early.

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::DecodeError;
use crate::request::RequestId;
use crate::sink::{ResultSink, TileUpdate};

/// A source rectangle and the output size it should be resampled to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadRegion {
    /// Source x-coordinate at native resolution
    pub src_x: u64,
    /// Source y-coordinate at native resolution
    pub src_y: u64,
    /// Source width at native resolution
    pub src_width: u64,
    /// Source height at native resolution
    pub src_height: u64,
    /// Output width in pixels
    pub dst_width: u32,
    /// Output height in pixels
    pub dst_height: u32,
}

impl ReadRegion {
    /// Creates a region.
    pub fn new(
        src_x: u64,
        src_y: u64,
        src_width: u64,
        src_height: u64,
        dst_width: u32,
        dst_height: u32,
    ) -> Self {
        Self {
            src_x,
            src_y,
            src_width,
            src_height,
            dst_width,
            dst_height,
        }
    }

    /// Returns true if either the source or destination area is zero.
    pub fn is_empty(&self) -> bool {
        self.src_width == 0 || self.src_height == 0 || self.dst_width == 0 || self.dst_height == 0
    }

    /// Source pixels per output pixel along x.
    pub fn subsample_x(&self) -> f64 {
        self.src_width as f64 / self.dst_width as f64
    }

    /// Source pixels per output pixel along y.
    pub fn subsample_y(&self) -> f64 {
        self.src_height as f64 / self.dst_height as f64
    }

    /// The full output buffer as a destination rectangle.
    pub fn dst_rect(&self) -> DstRect {
        DstRect::new(0, 0, self.dst_width, self.dst_height)
    }
}

/// A rectangle within a request's output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DstRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl DstRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// A raster that can be decoded region by region.
///
/// Implementations must be `Send + Sync`: `decode` runs on worker threads
/// while `abort` may be called from any thread.
pub trait TileSource: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &str {
        "tile-source"
    }

    /// Width of the raster at native resolution.
    fn native_width(&self) -> u64;

    /// Height of the raster at native resolution.
    fn native_height(&self) -> u64;

    /// Nominal tile width in pixels.
    fn tile_width(&self) -> u32;

    /// Nominal tile height in pixels.
    fn tile_height(&self) -> u32;

    /// Returns true if the source can produce any output resolution without
    /// brute-force subsampling (e.g. it stores overviews).
    fn is_multi_resolution(&self) -> bool {
        false
    }

    /// Returns false once the source has been disposed.
    ///
    /// Requests served after that point are reported as cancelled without
    /// calling `decode`.
    fn is_valid(&self) -> bool {
        true
    }

    /// Decodes `region`, blocking the calling worker.
    ///
    /// Pixels may be delivered incrementally through [`DecodeContext::update`];
    /// any non-empty bytes returned are delivered as a final update covering
    /// the whole output buffer.
    fn decode(&self, region: &ReadRegion, ctx: &mut DecodeContext<'_>) -> Result<Bytes, DecodeError>;

    /// Best-effort hook to interrupt an in-flight decode.
    ///
    /// Invoked when a request is cancelled while being serviced.
    fn abort(&self) {}
}

/// Per-decode context handed to [`TileSource::decode`].
pub struct DecodeContext<'a> {
    request_id: RequestId,
    token: &'a CancellationToken,
    sink: &'a dyn ResultSink,
    updates: usize,
}

impl<'a> DecodeContext<'a> {
    pub(crate) fn new(
        request_id: RequestId,
        token: &'a CancellationToken,
        sink: &'a dyn ResultSink,
    ) -> Self {
        Self {
            request_id,
            token,
            sink,
            updates: 0,
        }
    }

    /// The id of the request being decoded.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Returns true once the request has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns `Err(DecodeError::Cancelled)` once the request has been cancelled.
    pub fn check_cancelled(&self) -> Result<(), DecodeError> {
        if self.is_cancelled() {
            Err(DecodeError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The request's cancellation token, for decoders that await or
    /// propagate it.
    pub fn token(&self) -> &CancellationToken {
        self.token
    }

    /// Delivers a block of decoded pixels for `region` of the output buffer.
    pub fn update(&mut self, data: Bytes, region: DstRect) {
        self.updates += 1;
        self.sink
            .on_update(self.request_id, TileUpdate { data, region });
    }

    /// Number of updates delivered so far.
    pub fn updates_sent(&self) -> usize {
        self.updates
    }
}
