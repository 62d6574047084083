//! Priority buckets for pending fetch requests.
//!
//! Requests are partitioned by `(cost ceiling, prefetch)` so that cheap,
//! visible tiles never queue behind expensive or speculative ones. Each
//! bucket holds an ordered list whose **tail** is the next request a worker
//! takes; the dispatcher rebuilds every list on each re-sort cycle.
//!
//! # Layout
//!
//! With the default ceilings `[2, 17, 257, +inf]` there are eight buckets,
//! indexed ceiling-major:
//!
//! ```text
//! index:    0        1         2         3       ...    7
//! key:   (≤2,vis) (≤2,pre) (≤17,vis) (≤17,pre)   ... (≤inf,pre)
//! ```

use std::fmt;
use std::sync::Arc;

use crate::priority::PriorityComparator;
use crate::request::FetchRequest;

/// Identity of a bucket: which cost ceiling and which prefetch class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    /// Index into the configured ceilings (ascending).
    pub ceiling: usize,
    /// Whether the bucket holds prefetch requests.
    pub prefetch: bool,
}

impl BucketKey {
    /// Creates a key for the given ceiling index and prefetch class.
    pub fn new(ceiling: usize, prefetch: bool) -> Self {
        Self { ceiling, prefetch }
    }

    /// Position of this bucket in the bucket list.
    pub fn index(&self) -> usize {
        self.ceiling * 2 + usize::from(self.prefetch)
    }

    /// Inverse of [`BucketKey::index`].
    pub fn from_index(index: usize) -> Self {
        Self {
            ceiling: index / 2,
            prefetch: index % 2 == 1,
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = if self.prefetch { "prefetch" } else { "visible" };
        write!(f, "#{}/{}", self.ceiling, class)
    }
}

/// Point-in-time occupancy of one bucket.
#[derive(Clone, Debug, PartialEq)]
pub struct BucketLoad {
    pub key: BucketKey,
    pub max_cost: f64,
    pub pending: usize,
}

/// A holding area for pending requests of one cost/prefetch class.
pub(crate) struct PriorityBucket {
    key: BucketKey,
    max_cost: f64,
    queue: Vec<Arc<FetchRequest>>,
}

impl PriorityBucket {
    fn new(key: BucketKey, max_cost: f64) -> Self {
        Self {
            key,
            max_cost,
            queue: Vec::new(),
        }
    }

    pub(crate) fn key(&self) -> BucketKey {
        self.key
    }

    /// Returns true if the request belongs in this bucket's class.
    fn accepts(&self, request: &FetchRequest) -> bool {
        request.cost() <= self.max_cost && request.is_prefetch() == self.key.prefetch
    }

    /// Removes and returns the highest-priority request.
    pub(crate) fn pop(&mut self) -> Option<Arc<FetchRequest>> {
        self.queue.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<FetchRequest>> {
        self.queue.iter()
    }
}

impl fmt::Debug for PriorityBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityBucket")
            .field("key", &self.key)
            .field("max_cost", &self.max_cost)
            .field("len", &self.queue.len())
            .finish()
    }
}

/// The full set of buckets, scanned in ascending ceiling order.
///
/// Not thread-safe on its own; the dispatcher keeps it behind the bucket lock.
#[derive(Debug)]
pub(crate) struct BucketSet {
    buckets: Vec<PriorityBucket>,
}

impl BucketSet {
    /// Builds two buckets (visible, prefetch) per ceiling.
    ///
    /// Ceilings must already be validated as ascending.
    pub(crate) fn new(ceilings: &[f64]) -> Self {
        let buckets = ceilings
            .iter()
            .enumerate()
            .flat_map(|(ceiling, &max_cost)| {
                [false, true]
                    .into_iter()
                    .map(move |prefetch| PriorityBucket::new(BucketKey::new(ceiling, prefetch), max_cost))
            })
            .collect();
        Self { buckets }
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut PriorityBucket> {
        self.buckets.get_mut(index)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &PriorityBucket> {
        self.buckets.iter()
    }

    /// Index of the first bucket whose ceiling covers the request's cost and
    /// whose prefetch class matches.
    pub(crate) fn assign(&self, request: &FetchRequest) -> Option<usize> {
        self.buckets.iter().position(|bucket| bucket.accepts(request))
    }

    /// Moves every still-live request out of the buckets into `into`.
    ///
    /// Requests that were cancelled while queued are dropped here.
    pub(crate) fn drain_live_into(&mut self, into: &mut Vec<Arc<FetchRequest>>) -> usize {
        let mut dropped = 0;
        for bucket in &mut self.buckets {
            for request in bucket.queue.drain(..) {
                if request.is_live() {
                    into.push(request);
                } else {
                    dropped += 1;
                }
            }
        }
        dropped
    }

    /// Partitions `requests` into buckets and sorts each so its tail is the
    /// request that should run next.
    ///
    /// Replaces whatever the buckets held. Returns the requests no bucket
    /// accepted (impossible with a validated configuration).
    pub(crate) fn publish(
        &mut self,
        requests: Vec<Arc<FetchRequest>>,
        comparator: &PriorityComparator,
    ) -> Vec<Arc<FetchRequest>> {
        for bucket in &mut self.buckets {
            bucket.queue.clear();
        }

        let mut unassigned = Vec::new();
        for request in requests {
            match self.assign(&request) {
                Some(index) => self.buckets[index].queue.push(request),
                None => unassigned.push(request),
            }
        }

        for bucket in &mut self.buckets {
            // Ascending by rank means the winner sorts last.
            bucket
                .queue
                .sort_by(|a, b| comparator.compare(&b.priority_key(), &a.priority_key()));
        }

        unassigned
    }

    /// Snapshot of per-bucket occupancy.
    pub(crate) fn loads(&self) -> Vec<BucketLoad> {
        self.buckets
            .iter()
            .map(|bucket| BucketLoad {
                key: bucket.key,
                max_cost: bucket.max_cost,
                pending: bucket.len(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_BUCKET_CEILINGS;
    use crate::request::test_support::{make_request, TestSource};
    use crate::source::ReadRegion;

    fn region(subsample_x: u64, subsample_y: u64) -> ReadRegion {
        ReadRegion::new(0, 0, 256 * subsample_x, 256 * subsample_y, 256, 256)
    }

    #[test]
    fn test_key_index_roundtrip() {
        for index in 0..8 {
            assert_eq!(BucketKey::from_index(index).index(), index);
        }
        assert_eq!(BucketKey::new(1, true).index(), 3);
        assert_eq!(BucketKey::new(3, false).to_string(), "#3/visible");
    }

    #[test]
    fn test_default_layout_has_eight_buckets() {
        let set = BucketSet::new(&DEFAULT_BUCKET_CEILINGS);
        assert_eq!(set.iter().count(), 8);
        let keys: Vec<_> = set.iter().map(PriorityBucket::key).collect();
        assert_eq!(keys[0], BucketKey::new(0, false));
        assert_eq!(keys[1], BucketKey::new(0, true));
        assert_eq!(keys[7], BucketKey::new(3, true));
    }

    #[test]
    fn test_assign_picks_first_covering_ceiling() {
        let set = BucketSet::new(&DEFAULT_BUCKET_CEILINGS);
        let source = TestSource::single_resolution();

        // cost 1 -> ceiling 2
        let cheap = make_request(1, &source, region(1, 1), false);
        assert_eq!(set.assign(&cheap), Some(BucketKey::new(0, false).index()));

        // cost 16 -> ceiling 17
        let mid = make_request(2, &source, region(4, 4), false);
        assert_eq!(mid.cost(), 16.0);
        assert_eq!(set.assign(&mid), Some(BucketKey::new(1, false).index()));

        // cost 256 -> ceiling 257, prefetch class
        let big = make_request(3, &source, region(16, 16), true);
        assert_eq!(set.assign(&big), Some(BucketKey::new(2, true).index()));

        // cost 1024 -> unbounded
        let huge = make_request(4, &source, region(32, 32), false);
        assert_eq!(set.assign(&huge), Some(BucketKey::new(3, false).index()));
    }

    #[test]
    fn test_publish_orders_tail_first() {
        let mut set = BucketSet::new(&DEFAULT_BUCKET_CEILINGS);
        let source = TestSource::single_resolution();
        let first = make_request(1, &source, region(1, 1), false);
        let second = make_request(2, &source, region(1, 1), false);

        let leftover = set.publish(vec![second, first], &PriorityComparator::new(None));
        assert!(leftover.is_empty());

        let bucket = set.get_mut(0).unwrap();
        assert_eq!(bucket.len(), 2);
        // Older request (lower id) wins the tie and is popped first
        assert_eq!(bucket.pop().unwrap().id(), 1);
        assert_eq!(bucket.pop().unwrap().id(), 2);
    }

    #[test]
    fn test_drain_skips_cancelled() {
        let mut set = BucketSet::new(&DEFAULT_BUCKET_CEILINGS);
        let source = TestSource::single_resolution();
        let keep = make_request(1, &source, region(1, 1), false);
        let cancel = make_request(2, &source, region(1, 1), true);
        set.publish(vec![keep, Arc::clone(&cancel)], &PriorityComparator::new(None));

        cancel.cancel();

        let mut out = Vec::new();
        let dropped = set.drain_live_into(&mut out);
        assert_eq!(dropped, 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id(), 1);
        assert!(set.iter().all(|bucket| bucket.len() == 0));
    }

    #[test]
    fn test_loads_report_pending() {
        let mut set = BucketSet::new(&[4.0, f64::INFINITY]);
        let source = TestSource::single_resolution();
        set.publish(
            vec![
                make_request(1, &source, region(1, 1), false),
                make_request(2, &source, region(1, 1), false),
                make_request(3, &source, region(8, 8), true),
            ],
            &PriorityComparator::new(None),
        );

        let loads = set.loads();
        assert_eq!(loads.len(), 4);
        assert_eq!(loads[0].pending, 2);
        assert_eq!(loads[3].pending, 1);
        assert_eq!(loads[3].max_cost, f64::INFINITY);
    }
}
