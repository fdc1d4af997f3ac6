//! Step types shared by the store, the channel and the read model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a single step.
///
/// `Completed` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Error,
}

impl StepStatus {
    /// Whether no further progress is expected for the step
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Error)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::InProgress => write!(f, "in_progress"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Error => write!(f, "error"),
        }
    }
}

/// Caller-supplied description of a step, before any status is attached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
}

impl StepDefinition {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
        }
    }
}

/// One unit of work within an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Stable identifier, unique within an operation
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: StepStatus,
    /// Last local annotation
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Last progress percentage reported by the server (0-100)
    #[serde(default)]
    pub server_progress: Option<f64>,
    /// Last message reported by the server, kept apart from `message`
    #[serde(default)]
    pub server_message: Option<String>,
}

impl From<StepDefinition> for Step {
    fn from(def: StepDefinition) -> Self {
        Self {
            id: def.id,
            title: def.title,
            description: def.description,
            status: StepStatus::Pending,
            message: None,
            timestamp: None,
            server_progress: None,
            server_message: None,
        }
    }
}

/// Partial update merged into a step by `StepStateStore::update_step`.
///
/// Unset fields leave the step untouched. A missing `timestamp` means "now".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepPatch {
    pub status: Option<StepStatus>,
    pub message: Option<String>,
    pub server_progress: Option<f64>,
    pub server_message: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl StepPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: StepStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Server progress, clamped to 0-100
    pub fn server_progress(mut self, progress: f64) -> Self {
        self.server_progress = Some(progress.clamp(0.0, 100.0));
        self
    }

    pub fn server_message(mut self, message: impl Into<String>) -> Self {
        self.server_message = Some(message.into());
        self
    }

    /// Stamp the patch if no timestamp was set yet
    pub fn stamped(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp.get_or_insert(timestamp);
        self
    }
}
