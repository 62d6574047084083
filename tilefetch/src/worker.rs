//! Worker threads.
//!
//! Each worker is bound to an ordered list of buckets. It pops the tail of
//! the first non-empty bucket, claims the request and decodes it with the
//! bucket lock released. Requests cancelled while queued are discarded
//! without any callback; their `on_canceled` already fired when they were
//! cancelled. A panicking result sink fails its own request and leaves the
//! worker running.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::MutexGuard;
use tracing::{debug, trace, warn};

use crate::bucket::BucketKey;
use crate::dispatcher::Shared;
use crate::error::DecodeError;
use crate::request::{FetchRequest, Outcome};
use crate::source::DecodeContext;

/// Worker thread body.
pub(crate) fn run(shared: Arc<Shared>, worker: usize, buckets: Vec<usize>) {
    debug!(worker, ?buckets, "Worker started");

    let mut state = shared.buckets.lock();
    loop {
        if state.shutdown {
            break;
        }

        let next = buckets.iter().find_map(|&index| {
            let bucket = state.set.get_mut(index)?;
            let key = bucket.key();
            bucket.pop().map(|request| (key, request))
        });
        let Some((key, request)) = next else {
            shared.work_ready.wait(&mut state);
            continue;
        };

        if !request.try_begin_service() {
            trace!(worker, request_id = request.id(), "Discarding cancelled request");
            shared.metrics.requests_discarded(1);
            continue;
        }

        state.servicing[worker] = Some(Arc::clone(&request));
        MutexGuard::unlocked(&mut state, || guarded_service(&request, worker, key));
        state.servicing[worker] = None;
    }

    debug!(worker, "Worker stopped");
}

/// Runs [`service`], containing panics raised by the request's sink.
///
/// A request still in service after such a panic is resolved as failed.
fn guarded_service(request: &FetchRequest, worker: usize, bucket: BucketKey) {
    let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| service(request, worker, bucket))) else {
        return;
    };

    let message = panic_message(payload.as_ref());
    warn!(
        worker,
        request_id = request.id(),
        bucket = %bucket,
        panic = %message,
        "Result sink panicked"
    );
    // on_error goes to the same sink
    let failed = panic::catch_unwind(AssertUnwindSafe(|| {
        request.finish(Outcome::Failed(DecodeError::Panicked(message)))
    }));
    if failed.is_err() {
        warn!(worker, request_id = request.id(), "Result sink panicked again in on_error");
    }
}

/// Runs one claimed request to its terminal outcome.
fn service(request: &FetchRequest, worker: usize, bucket: BucketKey) {
    let id = request.id();
    let started = Instant::now();
    trace!(
        worker,
        request_id = id,
        bucket = %bucket,
        cost = request.cost(),
        queued_ms = request.age().as_millis() as u64,
        "Servicing request"
    );

    request.metrics().request_started();
    request.sink().on_started(id);

    let outcome = execute(request);
    debug!(
        worker,
        request_id = id,
        bucket = %bucket,
        outcome = ?outcome,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request finished"
    );
    request.finish(outcome);
}

fn execute(request: &FetchRequest) -> Outcome {
    let region = request.region();
    if region.is_empty() {
        return Outcome::Completed;
    }

    let source = request.source();
    if !source.is_valid() || request.token().is_cancelled() {
        return Outcome::Canceled;
    }

    let mut ctx = DecodeContext::new(request.id(), request.token(), request.sink());
    let result = panic::catch_unwind(AssertUnwindSafe(|| source.decode(region, &mut ctx)));

    match result {
        Ok(Ok(data)) => {
            if request.token().is_cancelled() {
                return Outcome::Canceled;
            }
            if !data.is_empty() {
                ctx.update(data, region.dst_rect());
            }
            Outcome::Completed
        }
        Ok(Err(error)) if error.is_cancelled() || request.token().is_cancelled() => {
            Outcome::Canceled
        }
        Ok(Err(error)) => Outcome::Failed(error),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(
                request_id = request.id(),
                source = source.name(),
                panic = %message,
                "Decoder panicked"
            );
            Outcome::Failed(DecodeError::Panicked(message))
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use bytes::Bytes;

    use super::*;
    use crate::request::{FetchSpec, RequestId, RequestState};
    use crate::sink::{ChannelSink, ResultSink, TileEvent};
    use crate::source::{DstRect, ReadRegion, TileSource};
    use crate::telemetry::SchedulerMetrics;

    struct ScriptedSource {
        valid: AtomicBool,
        behavior: fn(&mut DecodeContext<'_>) -> Result<Bytes, DecodeError>,
    }

    impl ScriptedSource {
        fn new(behavior: fn(&mut DecodeContext<'_>) -> Result<Bytes, DecodeError>) -> Arc<Self> {
            Arc::new(Self {
                valid: AtomicBool::new(true),
                behavior,
            })
        }
    }

    impl TileSource for ScriptedSource {
        fn native_width(&self) -> u64 {
            4096
        }

        fn native_height(&self) -> u64 {
            4096
        }

        fn tile_width(&self) -> u32 {
            256
        }

        fn tile_height(&self) -> u32 {
            256
        }

        fn is_valid(&self) -> bool {
            self.valid.load(Ordering::SeqCst)
        }

        fn decode(&self, _region: &ReadRegion, ctx: &mut DecodeContext<'_>) -> Result<Bytes, DecodeError> {
            (self.behavior)(ctx)
        }
    }

    fn run_one(source: Arc<ScriptedSource>, region: ReadRegion) -> (Arc<FetchRequest>, Vec<TileEvent>) {
        let (sink, mut rx) = ChannelSink::new();
        let request = Arc::new(FetchRequest::new(
            1,
            FetchSpec::region(source, region, Arc::new(sink)),
            Arc::new(SchedulerMetrics::new()),
        ));
        assert!(request.try_begin_service());
        service(&request, 0, BucketKey::new(0, false));

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (request, events)
    }

    fn full_tile() -> ReadRegion {
        ReadRegion::new(0, 0, 256, 256, 256, 256)
    }

    #[test]
    fn test_success_delivers_final_update() {
        let source = ScriptedSource::new(|_| Ok(Bytes::from_static(b"pixels")));
        let (request, events) = run_one(source, full_tile());

        assert_eq!(request.state(), RequestState::Completed);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], TileEvent::Started(1));
        match &events[1] {
            TileEvent::Update(1, update) => {
                assert_eq!(update.data.as_ref(), b"pixels");
                assert_eq!(update.region, full_tile().dst_rect());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(events[2], TileEvent::Completed(1));
    }

    #[test]
    fn test_empty_result_sends_no_update() {
        let source = ScriptedSource::new(|_| Ok(Bytes::new()));
        let (_, events) = run_one(source, full_tile());
        assert_eq!(events, vec![TileEvent::Started(1), TileEvent::Completed(1)]);
    }

    #[test]
    fn test_empty_region_completes_without_decode() {
        let source = ScriptedSource::new(|_| panic!("decode must not run"));
        let (request, events) = run_one(source, ReadRegion::new(0, 0, 0, 0, 256, 256));
        assert_eq!(request.state(), RequestState::Completed);
        assert_eq!(events, vec![TileEvent::Started(1), TileEvent::Completed(1)]);
    }

    #[test]
    fn test_invalid_source_is_cancelled() {
        let source = ScriptedSource::new(|_| panic!("decode must not run"));
        source.valid.store(false, Ordering::SeqCst);
        let (request, events) = run_one(source, full_tile());
        assert_eq!(request.state(), RequestState::Canceled);
        assert_eq!(events, vec![TileEvent::Started(1), TileEvent::Canceled(1)]);
    }

    #[test]
    fn test_decode_error_is_reported() {
        let source = ScriptedSource::new(|_| Err(DecodeError::format("bad tile")));
        let (request, events) = run_one(source, full_tile());
        assert_eq!(request.state(), RequestState::Failed);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], TileEvent::Failed(1, message) if message.contains("bad tile")));
    }

    #[test]
    fn test_cancelled_error_is_not_a_failure() {
        let source = ScriptedSource::new(|_| Err(DecodeError::Cancelled));
        let (request, events) = run_one(source, full_tile());
        assert_eq!(request.state(), RequestState::Canceled);
        assert_eq!(events[1], TileEvent::Canceled(1));
    }

    #[test]
    fn test_panic_is_contained() {
        let source = ScriptedSource::new(|_| panic!("corrupt block"));
        let (request, events) = run_one(source, full_tile());
        assert_eq!(request.state(), RequestState::Failed);
        assert!(matches!(&events[1], TileEvent::Failed(1, message) if message.contains("corrupt block")));
    }

    #[test]
    fn test_incremental_updates_precede_completion() {
        let source = ScriptedSource::new(|ctx| {
            ctx.update(Bytes::from_static(b"top"), DstRect::new(0, 0, 256, 128));
            ctx.update(Bytes::from_static(b"bottom"), DstRect::new(0, 128, 256, 128));
            Ok(Bytes::new())
        });
        let (_, events) = run_one(source, full_tile());
        assert_eq!(events.len(), 4);
        assert!(matches!(events[1], TileEvent::Update(1, _)));
        assert!(matches!(events[2], TileEvent::Update(1, _)));
        assert_eq!(events[3], TileEvent::Completed(1));
    }

    /// Sink that panics in one callback and records the rest.
    struct PanickingSink {
        panic_in: &'static str,
        events: parking_lot::Mutex<Vec<TileEvent>>,
    }

    impl PanickingSink {
        fn new(panic_in: &'static str) -> Arc<Self> {
            Arc::new(Self {
                panic_in,
                events: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn record(&self, callback: &str, event: TileEvent) {
            if callback == self.panic_in {
                panic!("sink failure in {}", callback);
            }
            self.events.lock().push(event);
        }
    }

    impl ResultSink for PanickingSink {
        fn on_started(&self, id: RequestId) {
            self.record("started", TileEvent::Started(id));
        }

        fn on_completed(&self, id: RequestId) {
            self.record("completed", TileEvent::Completed(id));
        }

        fn on_error(&self, id: RequestId, error: &DecodeError) {
            self.record("error", TileEvent::Failed(id, error.to_string()));
        }
    }

    fn run_guarded(sink: Arc<PanickingSink>) -> (Arc<FetchRequest>, Arc<SchedulerMetrics>) {
        let source = ScriptedSource::new(|_| Ok(Bytes::new()));
        let metrics = Arc::new(SchedulerMetrics::new());
        let request = Arc::new(FetchRequest::new(
            1,
            FetchSpec::region(source, full_tile(), sink),
            Arc::clone(&metrics),
        ));
        assert!(request.try_begin_service());
        guarded_service(&request, 0, BucketKey::new(0, false));
        (request, metrics)
    }

    #[test]
    fn test_sink_panic_on_start_fails_request() {
        let sink = PanickingSink::new("started");
        let (request, metrics) = run_guarded(Arc::clone(&sink));

        assert_eq!(request.state(), RequestState::Failed);
        let events = sink.events.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], TileEvent::Failed(1, message) if message.contains("sink failure in started")));
        assert_eq!(metrics.snapshot().failed, 1);
    }

    #[test]
    fn test_sink_panic_in_terminal_callback_keeps_outcome() {
        let sink = PanickingSink::new("completed");
        let (request, metrics) = run_guarded(Arc::clone(&sink));

        // The state moved before the callback ran
        assert_eq!(request.state(), RequestState::Completed);
        assert_eq!(*sink.events.lock(), vec![TileEvent::Started(1)]);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 0);
    }

    #[test]
    fn test_sink_panic_in_on_error_is_contained() {
        let source = ScriptedSource::new(|_| Err(DecodeError::format("bad tile")));
        let sink = PanickingSink::new("error");
        let request = Arc::new(FetchRequest::new(
            1,
            FetchSpec::region(source, full_tile(), Arc::clone(&sink) as Arc<dyn ResultSink>),
            Arc::new(SchedulerMetrics::new()),
        ));
        assert!(request.try_begin_service());
        guarded_service(&request, 0, BucketKey::new(0, false));

        assert_eq!(request.state(), RequestState::Failed);
        assert_eq!(*sink.events.lock(), vec![TileEvent::Started(1)]);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
