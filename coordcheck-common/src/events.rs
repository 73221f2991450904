//! Event types and the coordcheck event bus
//!
//! Downstream consumers (analytics bridges, monitoring) subscribe to a
//! broadcast bus carrying one message per verdict and one per learning
//! event. Delivery toward external brokers is at-least-once and fully
//! asynchronous; nothing on the request path blocks on a subscriber.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{LearningEvent, VerdictRecord};

/// Events published by the validation and learning flows
///
/// Each variant carries the routing topic it is destined for and the
/// partitioning key an external bridge should use (device for verdicts,
/// object for learning events). Events serialize with a `type` tag for
/// consumers that read them off the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CoordEvent {
    /// A validation verdict was issued
    ///
    /// Emitted once per validated report, alongside the matching
    /// analytics record. INVALID verdicts produce no event: rejected
    /// reports schedule no side effects.
    ///
    /// Triggers:
    /// - Bus bridge: publish to the refinement topic, partitioned by device
    /// - Monitoring: verdict mix and confidence distribution per device
    VerdictIssued {
        /// Routing topic (configured refinement topic)
        topic: String,
        /// Partition key: the reporting device id
        key: String,
        /// Same fields as the analytics `validation_requests` row
        record: VerdictRecord,
    },

    /// A learning request completed
    ///
    /// Emitted once per learning report, whatever the outcome; consumers
    /// see NEED_MORE_DATA and RANDOM_EXCLUDED results too, not just
    /// promotions.
    ///
    /// Triggers:
    /// - Bus bridge: publish to the learning topic, partitioned by object
    /// - Companion tooling: track which sources went STATIONARY and when
    SourceLearned {
        /// Routing topic (configured learning topic)
        topic: String,
        /// Partition key: the learning object id
        key: String,
        /// Outcome, classified sources, and the report coordinates
        event: LearningEvent,
    },
}

/// Central event distribution bus
///
/// Uses tokio::broadcast internally: non-blocking publish, multiple
/// concurrent subscribers, automatic cleanup when subscribers drop, lagged
/// message detection for slow subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoordEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<CoordEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` when at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: CoordEvent,
    ) -> Result<usize, broadcast::error::SendError<CoordEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the no-subscriber case
    ///
    /// Verdict and learning events are informational; it is acceptable for
    /// nothing to be listening.
    pub fn emit_ignore(&self, event: CoordEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::debug!("no subscribers for event: {:?}", e.0);
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Verdict;

    fn sample_record() -> VerdictRecord {
        VerdictRecord {
            device_id: "dev-1".into(),
            latitude: 55.75,
            longitude: 37.62,
            accuracy: 20.0,
            timestamp: 1_700_000_000,
            has_wifi: true,
            has_bt: false,
            has_cell: false,
            verdict: Verdict::Valid,
            confidence: 1.0,
            flow_type: "refinement".into(),
            insert_time: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_emitted_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(CoordEvent::VerdictIssued {
            topic: "coordinate-refinement".into(),
            key: "dev-1".into(),
            record: sample_record(),
        })
        .unwrap();

        match rx.recv().await.unwrap() {
            CoordEvent::VerdictIssued { key, record, .. } => {
                assert_eq!(key, "dev-1");
                assert_eq!(record.verdict, Verdict::Valid);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_tolerated() {
        let bus = EventBus::new(4);
        // Must not panic or error out the caller
        bus.emit_ignore(CoordEvent::VerdictIssued {
            topic: "coordinate-refinement".into(),
            key: "dev-1".into(),
            record: sample_record(),
        });
    }
}
