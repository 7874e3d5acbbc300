//! Fan-out registry: the set of open downstream connections and best-effort broadcast to all of them.
//! Membership lives behind one mutex that is never held across an await; delivery is a non-blocking
//! `try_send` per connection, so one slow or dead consumer cannot stall the others.

use crate::envelope::{Envelope, Frame, Greeting};
use crate::hermes_error_cause;
use crate::utils::OrError;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// Outbound queue is full; the consumer is not keeping up.
    Full,
    /// The connection's writer has gone away.
    Closed,
}

impl Display for DeliveryError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            DeliveryError::Full => f.write_str("outbound queue full"),
            DeliveryError::Closed => f.write_str("connection closed"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Outbound half of one downstream connection as seen by the registry.
pub trait ConnectionSink: Send + Sync {
    /// Queues a frame without waiting.
    fn try_send(&self, frame: Frame) -> Result<(), DeliveryError>;

    fn is_open(&self) -> bool;
}

impl ConnectionSink for mpsc::Sender<Frame> {
    fn try_send(&self, frame: Frame) -> Result<(), DeliveryError> {
        mpsc::Sender::try_send(self, frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    fn is_open(&self) -> bool {
        !self.is_closed()
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections a write was attempted on
    pub attempted: usize,
    pub delivered: usize,
    /// Connections dropped because they were closed or their write failed
    pub removed: usize,
}

pub struct FanoutRegistry {
    subscriptions: Arc<[String]>,
    connections: Mutex<HashMap<ConnectionId, Box<dyn ConnectionSink>>>,
    next_id: AtomicU64,
}

impl FanoutRegistry {
    pub fn new(subscriptions: Arc<[String]>) -> Self {
        Self {
            subscriptions,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    pub fn len(&self) -> usize {
        self.connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections().contains_key(&id)
    }

    /// Greets a new connection and adds it to the broadcast set.
    /// The greeting is queued before the connection becomes visible to `broadcast`, so it is always the first frame.
    /// Error: greeting cannot be queued → connection is not registered.
    /// Called by: `server::DownstreamServer` on every WebSocket handshake
    pub fn accept(&self, sink: impl ConnectionSink + 'static) -> OrError<ConnectionId> {
        let greeting = Greeting::new(&self.subscriptions).to_frame().map_err(|e| {
            hermes_error_cause!("registry::FanoutRegistry", "accept", "failed to serialize greeting", e)
        })?;
        sink.try_send(greeting).map_err(|e| {
            hermes_error_cause!("registry::FanoutRegistry", "accept", "failed to deliver greeting", e)
        })?;

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections().insert(id, Box::new(sink));
        tracing::debug!(connection = %id, "downstream connection registered");
        Ok(id)
    }

    /// Removes a connection. Returns `false` if it was already gone.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.connections().remove(&id).is_some();
        if removed {
            tracing::debug!(connection = %id, "downstream connection removed");
        }
        removed
    }

    /// Serializes the envelope once and offers the same frame to every registered connection.
    pub fn broadcast(&self, envelope: &Envelope) -> BroadcastReport {
        match envelope.to_frame() {
            Ok(frame) => self.broadcast_frame(frame),
            Err(e) => {
                tracing::error!(topic = envelope.topic(), "failed to serialize envelope: {}", e);
                BroadcastReport::default()
            }
        }
    }

    /// Delivers a frame to every open connection. A failure on one connection removes it and
    /// does not affect delivery to the rest.
    pub fn broadcast_frame(&self, frame: Frame) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut connections = self.connections();
        connections.retain(|id, sink| {
            if !sink.is_open() {
                tracing::debug!(connection = %id, "dropping closed connection");
                report.removed += 1;
                return false;
            }
            report.attempted += 1;
            match sink.try_send(frame.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    true
                }
                Err(e) => {
                    tracing::warn!(connection = %id, "dropping connection: {}", e);
                    report.removed += 1;
                    false
                }
            }
        });
        report
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Box<dyn ConnectionSink>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::normalize;
    use std::sync::atomic::AtomicUsize;

    /// Records every frame it accepts; optionally fails after a number of successful sends.
    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Arc<Mutex<Vec<Frame>>>,
        attempts: Arc<AtomicUsize>,
        fail_after: Option<usize>,
        closed: bool,
    }

    impl RecordingSink {
        fn failing_after(n: usize) -> Self {
            Self {
                fail_after: Some(n),
                ..Self::default()
            }
        }

        fn frames(&self) -> Vec<String> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|f| f.as_str().to_string())
                .collect()
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl ConnectionSink for RecordingSink {
        fn try_send(&self, frame: Frame) -> Result<(), DeliveryError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_after.is_some_and(|n| attempt >= n) {
                return Err(DeliveryError::Closed);
            }
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }

        fn is_open(&self) -> bool {
            !self.closed
        }
    }

    fn registry() -> FanoutRegistry {
        FanoutRegistry::new(vec!["classroom/+/telemetry".to_string()].into())
    }

    #[test]
    fn accept_sends_greeting_only() {
        let registry = registry();
        let sink = RecordingSink::default();
        registry.accept(sink.clone()).unwrap();

        let frames = sink.frames();
        assert_eq!(frames.len(), 1, "exactly one greeting expected");
        let greeting: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(greeting["type"], "hello");
        assert_eq!(greeting["topics"], serde_json::json!(["classroom/+/telemetry"]));
        assert!(greeting["ts"].is_i64());
    }

    #[test]
    fn accept_rejects_connection_when_greeting_fails() {
        let registry = registry();
        let result = registry.accept(RecordingSink::failing_after(0));
        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn broadcast_reaches_every_connection() {
        let registry = registry();
        let sinks: Vec<RecordingSink> = (0..5).map(|_| RecordingSink::default()).collect();
        for sink in &sinks {
            registry.accept(sink.clone()).unwrap();
        }

        let report = registry.broadcast(&normalize("classroom/5/telemetry", b"{}"));
        assert_eq!(
            report,
            BroadcastReport {
                attempted: 5,
                delivered: 5,
                removed: 0
            }
        );
        for sink in &sinks {
            // greeting + envelope
            assert_eq!(sink.attempts(), 2);
            assert_eq!(sink.frames().len(), 2);
        }
    }

    #[test]
    fn failed_write_is_isolated_and_removes_connection() {
        let registry = registry();
        let healthy: Vec<RecordingSink> = (0..3).map(|_| RecordingSink::default()).collect();
        for sink in &healthy {
            registry.accept(sink.clone()).unwrap();
        }
        // Greeting succeeds, first broadcast write fails
        let broken = RecordingSink::failing_after(1);
        let broken_id = registry.accept(broken.clone()).unwrap();

        let report = registry.broadcast(&normalize("flipper/1/x", b"1"));
        assert_eq!(report.attempted, 4);
        assert_eq!(report.delivered, 3);
        assert_eq!(report.removed, 1);
        assert!(!registry.contains(broken_id));
        assert_eq!(registry.len(), 3);

        // No further attempts on the removed connection
        registry.broadcast(&normalize("flipper/1/x", b"2"));
        assert_eq!(broken.attempts(), 2);
        for sink in &healthy {
            assert_eq!(sink.frames().len(), 3);
        }
    }

    #[test]
    fn closed_connection_is_skipped_and_removed() {
        let registry = registry();
        let closed = RecordingSink {
            closed: true,
            ..RecordingSink::default()
        };
        registry.accept(closed.clone()).unwrap();
        registry.accept(RecordingSink::default()).unwrap();

        let report = registry.broadcast(&normalize("other/x", b"1"));
        assert_eq!(report.attempted, 1);
        assert_eq!(report.removed, 1);
        // only the greeting was ever attempted
        assert_eq!(closed.attempts(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = registry();
        let sink = RecordingSink::default();
        let id = registry.accept(sink.clone()).unwrap();

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());

        registry.broadcast(&normalize("other/x", b"1"));
        assert_eq!(sink.attempts(), 1);
    }

    #[test]
    fn per_connection_order_is_preserved() {
        let registry = registry();
        let sink = RecordingSink::default();
        registry.accept(sink.clone()).unwrap();
        for i in 0..10 {
            registry.broadcast(&normalize("classroom/1/telemetry", i.to_string().as_bytes()));
        }
        let payloads: Vec<i64> = sink.frames()[1..]
            .iter()
            .map(|f| serde_json::from_str::<serde_json::Value>(f).unwrap()["payload"].as_i64().unwrap())
            .collect();
        assert_eq!(payloads, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn full_queue_drops_slow_consumer() {
        let registry = registry();
        let (slow_tx, _slow_rx) = mpsc::channel::<Frame>(2);
        let (fast_tx, mut fast_rx) = mpsc::channel::<Frame>(16);
        let slow_id = registry.accept(slow_tx).unwrap();
        registry.accept(fast_tx).unwrap();

        // greeting + 1 fills the slow queue; the next envelope overflows it
        registry.broadcast(&normalize("other/x", b"1"));
        let report = registry.broadcast(&normalize("other/x", b"2"));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed, 1);
        assert!(!registry.contains(slow_id));

        let mut received = 0;
        while fast_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[tokio::test]
    async fn dropped_receiver_counts_as_closed() {
        let registry = registry();
        let (tx, rx) = mpsc::channel::<Frame>(4);
        registry.accept(tx).unwrap();
        drop(rx);

        let report = registry.broadcast(&normalize("other/x", b"1"));
        assert_eq!(report.attempted, 0);
        assert_eq!(report.removed, 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_accept_and_broadcast() {
        let registry = Arc::new(registry());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let id = registry.accept(RecordingSink::default()).unwrap();
                        registry.broadcast(&normalize("other/x", b"1"));
                        assert!(registry.remove(id));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
