//! Progress events emitted by the batch orchestrator.
//!
//! Consumers (the CLI progress reporter, tests) receive events over an
//! unbounded channel; a disabled collector drops them silently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    ItemStarted {
        index: usize,
        timestamp: DateTime<Utc>,
    },
    ItemFinished {
        index: usize,
        timestamp: DateTime<Utc>,
        outcome: ItemOutcome,
        attempts: u32,
        duration_ms: u64,
    },
    CheckpointSaved {
        timestamp: DateTime<Utc>,
        processed: usize,
        path: PathBuf,
    },
}

impl BatchEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            BatchEvent::ItemStarted { timestamp, .. } => *timestamp,
            BatchEvent::ItemFinished { timestamp, .. } => *timestamp,
            BatchEvent::CheckpointSaved { timestamp, .. } => *timestamp,
        }
    }
}

/// Outcome of one batch item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Success { termination: String },
    Failure { reason: String, retryable: bool },
}

#[derive(Clone, Default)]
pub struct EventCollector {
    sender: Option<mpsc::UnboundedSender<BatchEvent>>,
}

impl EventCollector {
    /// Create a new event collector
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BatchEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// A collector that discards every event.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit_started(&self, index: usize) {
        self.emit(BatchEvent::ItemStarted {
            index,
            timestamp: Utc::now(),
        });
    }

    pub fn emit_finished(&self, index: usize, outcome: ItemOutcome, attempts: u32, duration_ms: u64) {
        self.emit(BatchEvent::ItemFinished {
            index,
            timestamp: Utc::now(),
            outcome,
            attempts,
            duration_ms,
        });
    }

    pub fn emit_checkpoint(&self, processed: usize, path: PathBuf) {
        self.emit(BatchEvent::CheckpointSaved {
            timestamp: Utc::now(),
            processed,
            path,
        });
    }

    fn emit(&self, event: BatchEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(e) = sender.send(event) {
            tracing::warn!(error = %e, "Failed to emit batch event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collector_forwards_events() {
        let (collector, mut receiver) = EventCollector::new();
        collector.emit_started(7);
        collector.emit_finished(
            7,
            ItemOutcome::Success {
                termination: "answered".into(),
            },
            1,
            15,
        );

        match receiver.recv().await.unwrap() {
            BatchEvent::ItemStarted { index, .. } => assert_eq!(index, 7),
            other => panic!("Expected ItemStarted, got {other:?}"),
        }
        match receiver.recv().await.unwrap() {
            BatchEvent::ItemFinished { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("Expected ItemFinished, got {other:?}"),
        }
    }

    #[test]
    fn disabled_collector_is_silent() {
        EventCollector::disabled().emit_started(1);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = BatchEvent::CheckpointSaved {
            timestamp: Utc::now(),
            processed: 20,
            path: PathBuf::from("out/checkpoint.json"),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "checkpoint_saved");
        assert_eq!(value["processed"], 20);
    }
}
