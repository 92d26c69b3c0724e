//! Fire-and-forget broadcast to live push consumers.
//!
//! Every consumer owns a bounded FIFO queue drained by exactly one writer
//! (a WebSocket task in the server). `broadcast` only ever does a
//! non-blocking `try_send`, so a slow socket can fill its own queue but never
//! stalls delivery to the others. A consumer whose queue is closed or full is
//! dropped from the live set; the writer notices the closed queue and ends the
//! session, after which the client is expected to reconnect and backfill from
//! history.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::types::DeliveryFrame;

/// Queue depth per consumer before it is considered lagging.
pub const DEFAULT_CONSUMER_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

impl std::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("failed to encode delivery frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Receiving half handed to a consumer on registration.
#[derive(Debug)]
pub struct Subscription {
    id: ConsumerId,
    receiver: mpsc::Receiver<Arc<str>>,
}

impl Subscription {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Next frame; `None` once the fanout dropped this consumer.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryFanout {
    inner: Arc<Mutex<FanoutState>>,
}

#[derive(Debug)]
struct FanoutState {
    consumers: HashMap<ConsumerId, mpsc::Sender<Arc<str>>>,
    next_id: u64,
    queue_capacity: usize,
}

impl DeliveryFanout {
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_CONSUMER_QUEUE)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FanoutState {
                consumers: HashMap::new(),
                next_id: 1,
                queue_capacity: queue_capacity.max(1),
            })),
        }
    }

    pub fn register(&self) -> Subscription {
        let mut state = self.inner.lock();
        let (sender, receiver) = mpsc::channel(state.queue_capacity);
        let id = ConsumerId(state.next_id);
        state.next_id += 1;
        state.consumers.insert(id, sender);
        debug!(consumer = %id, live = state.consumers.len(), "Registered consumer");

        Subscription { id, receiver }
    }

    /// Remove a consumer. Returns false when it was already gone.
    pub fn unregister(&self, id: ConsumerId) -> bool {
        let mut state = self.inner.lock();
        let removed = state.consumers.remove(&id).is_some();
        if removed {
            debug!(consumer = %id, live = state.consumers.len(), "Unregistered consumer");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().consumers.is_empty()
    }

    pub fn contains(&self, id: ConsumerId) -> bool {
        self.inner.lock().consumers.contains_key(&id)
    }

    /// Serialize once and push to every live consumer.
    pub fn broadcast(&self, frame: &DeliveryFrame<'_>) -> Result<BroadcastReport, FanoutError> {
        let text: Arc<str> = Arc::from(serde_json::to_string(frame)?);
        Ok(self.broadcast_text(text))
    }

    /// Push an already-encoded frame to every live consumer.
    pub fn broadcast_text(&self, text: Arc<str>) -> BroadcastReport {
        let mut state = self.inner.lock();
        let mut report = BroadcastReport::default();
        let mut dead = Vec::new();

        for (id, sender) in &state.consumers {
            match sender.try_send(Arc::clone(&text)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(consumer = %id, "Consumer queue full; dropping lagging consumer");
                    dead.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(consumer = %id, "Consumer closed; removing from live set");
                    dead.push(*id);
                }
            }
        }

        for id in &dead {
            state.consumers.remove(id);
        }
        report.dropped = dead.len();

        if report.dropped > 0 {
            counter!("adrelay.fanout.dropped", report.dropped as u64);
        }

        report
    }
}

impl Default for DeliveryFanout {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeliverySource, HistoryEntry};
    use chrono::Utc;
    use serde_json::json;

    fn entry(n: u64) -> HistoryEntry {
        HistoryEntry {
            id: n,
            payload: json!({ "n": n }),
            timestamp: Utc::now(),
            request_id: format!("req_{}", n),
            source: DeliverySource::Single,
        }
    }

    fn decode(text: &str) -> serde_json::Value {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn register_and_unregister_are_idempotent() {
        let fanout = DeliveryFanout::new();
        let sub = fanout.register();
        assert_eq!(fanout.len(), 1);

        assert!(fanout.unregister(sub.id()));
        assert!(!fanout.unregister(sub.id()));
        assert!(fanout.is_empty());
    }

    #[test]
    fn failed_consumer_does_not_affect_others() {
        let fanout = DeliveryFanout::new();
        let first = fanout.register();
        let mut second = fanout.register();
        let first_id = first.id();

        // the first consumer's socket went away
        drop(first);

        let e = entry(1);
        let report = fanout.broadcast(&DeliveryFrame::from(&e)).unwrap();
        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 1 });

        let got = decode(&second.try_recv().unwrap());
        assert_eq!(got["data"], json!({ "n": 1 }));
        assert_eq!(got["requestId"], "req_1");
        assert!(!fanout.contains(first_id));
        assert!(fanout.contains(second.id()));
    }

    #[test]
    fn per_consumer_order_matches_broadcast_order() {
        let fanout = DeliveryFanout::new();
        let mut a = fanout.register();
        let mut b = fanout.register();

        for n in 1..=5 {
            let e = entry(n);
            fanout.broadcast(&DeliveryFrame::from(&e)).unwrap();
        }

        for sub in [&mut a, &mut b] {
            let seen: Vec<u64> = std::iter::from_fn(|| sub.try_recv())
                .map(|t| decode(&t)["data"]["n"].as_u64().unwrap())
                .collect();
            assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        }
    }

    #[test]
    fn lagging_consumer_is_dropped_without_blocking() {
        let fanout = DeliveryFanout::with_queue_capacity(2);
        let _stuck = fanout.register();
        let mut live = fanout.register();

        let mut dropped = 0;
        for n in 1..=3 {
            let e = entry(n);
            let report = fanout.broadcast(&DeliveryFrame::from(&e)).unwrap();
            dropped += report.dropped;
            // keep the live consumer drained
            assert!(live.try_recv().is_some());
        }

        assert_eq!(dropped, 1);
        assert_eq!(fanout.len(), 1);
        assert!(fanout.contains(live.id()));
    }

    #[tokio::test]
    async fn recv_ends_after_removal() {
        let fanout = DeliveryFanout::new();
        let mut sub = fanout.register();
        fanout.broadcast_text(Arc::from("hello"));
        fanout.unregister(sub.id());

        assert_eq!(sub.recv().await.as_deref(), Some("hello"));
        assert!(sub.recv().await.is_none());
    }
}
