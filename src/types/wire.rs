//! JSON messages exchanged over the realtime socket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::step::StepStatus;

/// Progress notification pushed by the server for one step of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub operation_id: String,
    /// Id of the step the update refers to
    pub step: String,
    pub status: StepStatus,
    #[serde(default)]
    pub message: Option<String>,
    /// Percentage reported by the server (0-100)
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ProgressUpdate {
    /// Parse an inbound text frame
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn belongs_to(&self, operation_id: &str) -> bool {
        self.operation_id == operation_id
    }
}

/// Control message sent from the client to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    StartOperation { operation_id: String },
    StopOperation { operation_id: String },
}

impl ControlMessage {
    pub fn start(operation_id: impl Into<String>) -> Self {
        ControlMessage::StartOperation {
            operation_id: operation_id.into(),
        }
    }

    pub fn stop(operation_id: impl Into<String>) -> Self {
        ControlMessage::StopOperation {
            operation_id: operation_id.into(),
        }
    }

    pub fn operation_id(&self) -> &str {
        match self {
            ControlMessage::StartOperation { operation_id }
            | ControlMessage::StopOperation { operation_id } => operation_id,
        }
    }

    /// Encode as the JSON text frame sent on the socket
    pub fn to_frame(&self) -> String {
        // Serializing a tagged enum of plain strings cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_update() {
        let text = r#"{"operation_id":"remove-config-123","step":"remove-router","status":"completed","message":"done","progress":100,"timestamp":"2024-05-01T10:00:00Z"}"#;
        let update = ProgressUpdate::parse(text).unwrap();
        assert_eq!(update.operation_id, "remove-config-123");
        assert_eq!(update.step, "remove-router");
        assert_eq!(update.status, StepStatus::Completed);
        assert_eq!(update.message.as_deref(), Some("done"));
        assert_eq!(update.progress, Some(100.0));
        assert!(update.timestamp.is_some());
        assert!(update.belongs_to("remove-config-123"));
        assert!(!update.belongs_to("other-op"));
    }

    #[test]
    fn test_parse_minimal_update() {
        let text = r#"{"operation_id":"op","step":"s1","status":"in_progress"}"#;
        let update = ProgressUpdate::parse(text).unwrap();
        assert_eq!(update.status, StepStatus::InProgress);
        assert!(update.message.is_none());
        assert!(update.progress.is_none());
        assert!(update.timestamp.is_none());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ProgressUpdate::parse("not json").is_err());
        assert!(ProgressUpdate::parse(r#"{"operation_id":"op"}"#).is_err());
        assert!(ProgressUpdate::parse(r#"{"operation_id":"op","step":"s","status":"exploded"}"#).is_err());
    }

    #[test]
    fn test_control_frames() {
        assert_eq!(
            ControlMessage::start("op-1").to_frame(),
            r#"{"type":"start_operation","operation_id":"op-1"}"#
        );
        assert_eq!(
            ControlMessage::stop("op-1").to_frame(),
            r#"{"type":"stop_operation","operation_id":"op-1"}"#
        );
        assert_eq!(ControlMessage::stop("op-1").operation_id(), "op-1");
    }
}
