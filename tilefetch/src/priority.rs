//! Priority ordering for fetch requests.
//!
//! The comparator is evaluated as an ordered sequence of tie-breaks, each
//! decisive when non-equal:
//!
//! 1. **Cost** - lower decode cost runs first
//! 2. **Resolution tier** - coarser (larger subsample) runs first, so a fast
//!    preview beats a slow full-resolution fetch of the same cost
//! 3. **Viewpoint containment** - an envelope containing the viewpoint wins
//! 4. **Viewpoint distance** - the nearer envelope wins; an unknown distance
//!    counts as infinitely far, so two unknown envelopes tie
//! 5. **Age** - the lower id (submitted earlier) wins
//!
//! # Example
//!
//! ```
//! use std::cmp::Ordering;
//! use tilefetch::{Envelope, PriorityComparator, PriorityKey};
//!
//! let preview = PriorityKey { id: 2, cost: 1.0, subsample: 4.0, bounds: Envelope::UNKNOWN };
//! let full = PriorityKey { id: 1, cost: 1.0, subsample: 1.0, bounds: Envelope::UNKNOWN };
//!
//! let cmp = PriorityComparator::new(None);
//! assert_eq!(cmp.compare(&preview, &full), Ordering::Less);
//! ```

use std::cmp::Ordering;

use crate::geo::{Envelope, GeoPoint};
use crate::request::RequestId;
use crate::source::ReadRegion;

/// The fields of a request that participate in ordering.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PriorityKey {
    pub id: RequestId,
    pub cost: f64,
    pub subsample: f64,
    pub bounds: Envelope,
}

/// Orders requests for execution relative to a viewpoint snapshot.
///
/// `compare(a, b)` returns [`Ordering::Less`] when `a` should run before `b`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PriorityComparator {
    viewpoint: Option<GeoPoint>,
}

impl PriorityComparator {
    /// Creates a comparator for the given viewpoint.
    ///
    /// Without a viewpoint the geographic tie-breaks are skipped.
    pub fn new(viewpoint: Option<GeoPoint>) -> Self {
        Self { viewpoint }
    }

    /// Returns the viewpoint snapshot in use.
    pub fn viewpoint(&self) -> Option<GeoPoint> {
        self.viewpoint
    }

    /// Compares two requests; `Less` means `a` runs first.
    pub fn compare(&self, a: &PriorityKey, b: &PriorityKey) -> Ordering {
        a.cost
            .total_cmp(&b.cost)
            .then_with(|| b.subsample.total_cmp(&a.subsample))
            .then_with(|| self.compare_geography(a, b))
            .then_with(|| a.id.cmp(&b.id))
    }

    fn compare_geography(&self, a: &PriorityKey, b: &PriorityKey) -> Ordering {
        let Some(viewpoint) = self.viewpoint.filter(GeoPoint::is_valid) else {
            return Ordering::Equal;
        };

        let a_contains = a.bounds.contains(&viewpoint);
        let b_contains = b.bounds.contains(&viewpoint);
        if a_contains != b_contains {
            return if a_contains {
                Ordering::Less
            } else {
                Ordering::Greater
            };
        }

        let distance = |key: &PriorityKey| {
            key.bounds
                .distance_to(&viewpoint)
                .unwrap_or(f64::INFINITY)
        };
        distance(a).total_cmp(&distance(b))
    }
}

/// Rounds down to the nearest power of two (`2^floor(log2(value))`).
///
/// Values below one yield fractional powers (0.5, 0.25, ...).
fn floor_pow2(value: f64) -> f64 {
    2f64.powi(value.log2().floor() as i32)
}

/// Quantized decode cost of a region.
///
/// Multi-resolution sources can produce any output size natively, so every
/// request they serve costs 1. Otherwise the cost is the number of source
/// pixels per output pixel, rounded down to a power of two.
pub(crate) fn decode_cost(region: &ReadRegion, multi_resolution: bool) -> f64 {
    if multi_resolution || region.is_empty() {
        return 1.0;
    }
    floor_pow2(region.subsample_x() * region.subsample_y())
}

/// Resolution tier of a region.
///
/// The larger of the per-axis subsample factors, rounded down to a power of
/// two when downsampling and left as-is when upsampling.
pub(crate) fn subsample_tier(region: &ReadRegion) -> f64 {
    if region.is_empty() {
        return 1.0;
    }
    let subsample = region.subsample_x().max(region.subsample_y());
    if subsample < 1.0 {
        subsample
    } else {
        floor_pow2(subsample)
    }
}
