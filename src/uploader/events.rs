//! Fine-grained progress events, independent of the pollable snapshot.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::commands::SessionStatus;

/// Capacity of the shared event channel; slow consumers lag rather than block
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub type EventSender = broadcast::Sender<ProgressEvent>;
pub type EventReceiver = broadcast::Receiver<ProgressEvent>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub session_id: String,
    #[serde(flatten)]
    pub phase: UploadPhase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum UploadPhase {
    Preparing { file_path: String },
    LoadingMetadata { file_paths: Vec<String> },
    Grouped { group_count: usize },
    GroupStart { group_index: usize, total_groups: usize },
    Compressing { file_path: String },
    Uploading { file_paths: Vec<String> },
    ItemSuccess { file_path: String },
    ItemError { file_path: String, message: String },
    SessionFinished { status: SessionStatus },
}

impl ProgressEvent {
    pub fn new(session_id: &str, phase: UploadPhase) -> Self {
        Self {
            session_id: session_id.to_string(),
            phase,
        }
    }
}

pub fn channel() -> (EventSender, EventReceiver) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_phase_tag() {
        let event = ProgressEvent::new(
            "abc",
            UploadPhase::GroupStart {
                group_index: 1,
                total_groups: 5,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["session_id"], "abc");
        assert_eq!(json["phase"], "group_start");
        assert_eq!(json["group_index"], 1);
        assert_eq!(json["total_groups"], 5);
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_only_new_events() {
        let (tx, _rx) = channel();
        tx.send(ProgressEvent::new("s", UploadPhase::Grouped { group_count: 2 }))
            .unwrap();

        let mut late = tx.subscribe();
        tx.send(ProgressEvent::new(
            "s",
            UploadPhase::ItemSuccess {
                file_path: "a.png".to_string(),
            },
        ))
        .unwrap();

        let received = late.recv().await.unwrap();
        assert!(matches!(received.phase, UploadPhase::ItemSuccess { .. }));
    }
}
