//! Verdict event bus
//!
//! The validator publishes one event per finished (or failed) run. Downstream
//! consumers such as notification dispatch subscribe here and decide on their own
//! what to deliver; the publisher knows nothing about delivery channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Verdict status of one payment proof
///
/// `Pending` is the only non-terminal state. Once a terminal state is recorded
/// for a submission it never goes back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Pending,
    AutoApproved,
    ManualReview,
    Rejected,
}

impl ValidationStatus {
    /// Database / wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Pending => "PENDING",
            ValidationStatus::AutoApproved => "AUTO_APPROVED",
            ValidationStatus::ManualReview => "MANUAL_REVIEW",
            ValidationStatus::Rejected => "REJECTED",
        }
    }

    /// Parse the database representation
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(ValidationStatus::Pending),
            "AUTO_APPROVED" => Some(ValidationStatus::AutoApproved),
            "MANUAL_REVIEW" => Some(ValidationStatus::ManualReview),
            "REJECTED" => Some(ValidationStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ValidationStatus::Pending)
    }
}

impl std::fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the validation pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VerdictEvent {
    /// A run finished with a terminal verdict
    VerdictIssued {
        payment_submission_id: Uuid,
        status: ValidationStatus,
        confidence_score: f32,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A run could not complete (image unreadable); the submission stays pending
    ValidationFailed {
        payment_submission_id: Uuid,
        reason: String,
        retryable: bool,
        timestamp: DateTime<Utc>,
    },
}

impl VerdictEvent {
    /// Event name used for SSE `event:` lines
    pub fn event_type(&self) -> &'static str {
        match self {
            VerdictEvent::VerdictIssued { .. } => "VerdictIssued",
            VerdictEvent::ValidationFailed { .. } => "ValidationFailed",
        }
    }

    pub fn payment_submission_id(&self) -> Uuid {
        match self {
            VerdictEvent::VerdictIssued {
                payment_submission_id,
                ..
            }
            | VerdictEvent::ValidationFailed {
                payment_submission_id,
                ..
            } => *payment_submission_id,
        }
    }
}

/// Broadcast bus for verdict events
///
/// Cloning shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<VerdictEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the given channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<VerdictEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring the case where nobody is listening
    pub fn emit_lossy(&self, event: VerdictEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("No verdict event subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_db_text() {
        for status in [
            ValidationStatus::Pending,
            ValidationStatus::AutoApproved,
            ValidationStatus::ManualReview,
            ValidationStatus::Rejected,
        ] {
            assert_eq!(ValidationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ValidationStatus::parse("APPROVED"), None);
    }

    #[test]
    fn test_only_pending_is_non_terminal() {
        assert!(!ValidationStatus::Pending.is_terminal());
        assert!(ValidationStatus::Rejected.is_terminal());
    }

    #[test]
    fn test_status_serializes_screaming_snake() {
        let json = serde_json::to_string(&ValidationStatus::ManualReview).unwrap();
        assert_eq!(json, "\"MANUAL_REVIEW\"");
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();

        bus.emit_lossy(VerdictEvent::VerdictIssued {
            payment_submission_id: id,
            status: ValidationStatus::AutoApproved,
            confidence_score: 91.0,
            reason: "all signals agree".to_string(),
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "VerdictIssued");
        assert_eq!(event.payment_submission_id(), id);
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.emit_lossy(VerdictEvent::ValidationFailed {
            payment_submission_id: Uuid::new_v4(),
            reason: "fetch failed".to_string(),
            retryable: true,
            timestamp: Utc::now(),
        });
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.capacity(), 4);
    }
}
