//! Result delivery for fetch requests.
//!
//! Every request carries a [`ResultSink`]. For a request that reaches a
//! worker the callbacks arrive as `on_started`, zero or more `on_update`,
//! then exactly one of `on_completed`, `on_canceled` or `on_error`. A request
//! cancelled before any worker took it receives only `on_canceled`.
//!
//! Callbacks run on worker threads (or on the cancelling thread for pending
//! requests) and must not block for long: a slow sink stalls a worker.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::DecodeError;
use crate::request::RequestId;
use crate::source::DstRect;

/// A block of decoded pixels for part of a request's output buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct TileUpdate {
    pub data: Bytes,
    pub region: DstRect,
}

/// Receives progress and outcome of fetch requests.
///
/// All methods default to no-ops so sinks implement only what they need.
pub trait ResultSink: Send + Sync {
    /// A worker has begun decoding the request.
    fn on_started(&self, _id: RequestId) {}

    /// Decoded pixels are available.
    fn on_update(&self, _id: RequestId, _update: TileUpdate) {}

    /// The decode finished successfully.
    fn on_completed(&self, _id: RequestId) {}

    /// The request was cancelled.
    fn on_canceled(&self, _id: RequestId) {}

    /// The decode failed.
    fn on_error(&self, _id: RequestId, _error: &DecodeError) {}
}

/// Sink that ignores every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ResultSink for NoopSink {}

/// A callback flattened into a value.
#[derive(Debug, Clone, PartialEq)]
pub enum TileEvent {
    Started(RequestId),
    Update(RequestId, TileUpdate),
    Completed(RequestId),
    Canceled(RequestId),
    /// The error's display text; errors themselves are not `Clone`.
    Failed(RequestId, String),
}

impl TileEvent {
    /// The request this event belongs to.
    pub fn request_id(&self) -> RequestId {
        match self {
            Self::Started(id)
            | Self::Update(id, _)
            | Self::Completed(id)
            | Self::Canceled(id)
            | Self::Failed(id, _) => *id,
        }
    }

    /// Returns true for completed, canceled and failed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed(_) | Self::Canceled(_) | Self::Failed(_, _)
        )
    }
}

/// Sink that forwards every callback as a [`TileEvent`] over an unbounded
/// channel.
///
/// Sending never blocks, so the channel is safe to use from worker threads;
/// the receiver can be drained from async code or with `blocking_recv`.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TileEvent>,
}

impl ChannelSink {
    /// Creates a sink and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TileEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: TileEvent) {
        // Receiver gone: nobody is listening any more
        let _ = self.tx.send(event);
    }
}

impl ResultSink for ChannelSink {
    fn on_started(&self, id: RequestId) {
        self.send(TileEvent::Started(id));
    }

    fn on_update(&self, id: RequestId, update: TileUpdate) {
        self.send(TileEvent::Update(id, update));
    }

    fn on_completed(&self, id: RequestId) {
        self.send(TileEvent::Completed(id));
    }

    fn on_canceled(&self, id: RequestId) {
        self.send(TileEvent::Canceled(id));
    }

    fn on_error(&self, id: RequestId, error: &DecodeError) {
        self.send(TileEvent::Failed(id, error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        assert_eq!(TileEvent::Started(3).request_id(), 3);
        assert!(!TileEvent::Started(3).is_terminal());
        assert!(TileEvent::Completed(3).is_terminal());
        assert!(TileEvent::Canceled(4).is_terminal());
        assert!(TileEvent::Failed(5, "boom".into()).is_terminal());
    }

    #[test]
    fn test_channel_sink_forwards_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.on_started(1);
        sink.on_update(
            1,
            TileUpdate {
                data: Bytes::from_static(b"px"),
                region: DstRect::new(0, 0, 1, 1),
            },
        );
        sink.on_error(1, &DecodeError::format("bad header"));

        assert_eq!(rx.try_recv().unwrap(), TileEvent::Started(1));
        assert!(matches!(rx.try_recv().unwrap(), TileEvent::Update(1, _)));
        match rx.try_recv().unwrap() {
            TileEvent::Failed(1, message) => assert!(message.contains("bad header")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.on_completed(1);
    }

    #[tokio::test]
    async fn test_channel_sink_from_another_thread() {
        let (sink, mut rx) = ChannelSink::new();
        std::thread::spawn(move || {
            sink.on_started(8);
            sink.on_completed(8);
        });

        assert_eq!(rx.recv().await, Some(TileEvent::Started(8)));
        assert_eq!(rx.recv().await, Some(TileEvent::Completed(8)));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_noop_sink_accepts_everything() {
        let sink = NoopSink;
        sink.on_started(1);
        sink.on_canceled(1);
    }
}
