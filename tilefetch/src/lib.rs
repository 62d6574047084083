//! Tilefetch - priority-ordered tile fetching for raster imagery
//!
//! This library decouples "a map view wants pixels for a region at a given
//! resolution" from "decode that region from a raster source". Requests are
//! submitted to a [`Scheduler`], partitioned into cost/prefetch buckets,
//! re-sorted against the current viewpoint, and drained by a fixed pool of
//! worker threads that call the source's blocking decode.
//!
//! # Architecture
//!
//! ```text
//! submit() ──► Intake ──► Dispatcher thread ──► Buckets (cost × prefetch)
//!                            ▲   │ re-sort vs viewpoint        │
//! set_viewpoint() ───────────┘   ▼                             ▼
//!                                                  Workers ──► TileSource::decode
//!                                                      │
//!                                                      ▼
//!                                                 ResultSink callbacks
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tilefetch::{Envelope, FetchSpec, GeoPoint, Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::new(SchedulerConfig::default())?;
//! scheduler.set_viewpoint(GeoPoint::new(53.55, 9.99));
//!
//! let handle = scheduler.submit(
//!     FetchSpec::tile(source.clone(), 2, 10, 7, sink.clone())
//!         .with_bounds(Envelope::new(9.9, 53.5, 10.1, 53.6)),
//! )?;
//!
//! // Later, when the tile scrolls out of view
//! handle.cancel();
//! ```

pub mod bucket;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod geo;
pub mod priority;
pub mod request;
pub mod sink;
pub mod source;
pub mod telemetry;
pub mod tile;

mod worker;

pub use bucket::{BucketKey, BucketLoad};
pub use config::{SchedulerConfig, WorkerLayout};
pub use dispatcher::Scheduler;
pub use error::{ConfigError, DecodeError, SchedulerError};
pub use geo::{Envelope, GeoPoint};
pub use priority::{PriorityComparator, PriorityKey};
pub use request::{FetchSpec, Geometry, RequestHandle, RequestId, RequestState};
pub use sink::{ChannelSink, NoopSink, ResultSink, TileEvent, TileUpdate};
pub use source::{DecodeContext, DstRect, ReadRegion, TileSource};
pub use telemetry::{MetricsSnapshot, SchedulerMetrics};
