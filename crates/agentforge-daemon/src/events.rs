//! Broadcast bus for orchestrator events.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tracing::trace;

use agentforge_core::db::unix_timestamp;
use agentforge_core::{EventEnvelope, OrchestratorEvent};

/// Capacity of the event channel. Lagging subscribers lose the oldest events.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Cloneable handle to the daemon-wide event channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
    seq: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Stamp and send an event. Never waits on subscribers.
    pub fn publish(&self, event: OrchestratorEvent) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(seq, event = event.name(), "Publishing event");
        let envelope = EventEnvelope {
            seq,
            timestamp: unix_timestamp(),
            event,
        };
        // No subscribers is fine.
        let _ = self.tx.send(envelope);
        seq
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_is_monotonic() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(OrchestratorEvent::FeatureRemoved { feature_id: 1 });
        bus.publish(OrchestratorEvent::FeatureRemoved { feature_id: 2 });
        assert_eq!(rx.recv().await.unwrap().seq, 1);
        assert_eq!(rx.recv().await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_without_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for id in 0..(EVENT_BUS_CAPACITY as i64 + 10) {
            bus.publish(OrchestratorEvent::FeatureRemoved { feature_id: id });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(10))
        ));
        assert_eq!(rx.recv().await.unwrap().seq, 11);
    }

    #[test]
    fn publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(OrchestratorEvent::FeatureRemoved { feature_id: 1 }), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
