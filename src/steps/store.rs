//! In-memory reducer holding the steps of the active operation.
//!
//! Every mutation goes through a named transition. Local calls and server
//! updates share the same entry points and write to one `Step` per id.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{Step, StepDefinition, StepPatch, StepStatus};

/// What to do when a terminal step is moved to the other terminal status
/// (e.g. a server update reporting `error` for a step already `completed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalOverwrite {
    /// Accept the later status as a correction
    #[default]
    Allow,
    /// Keep the first terminal status reached
    Reject,
}

/// Ordered step list for one operation plus the manual advance pointer
#[derive(Debug, Clone, Default)]
pub struct StepStateStore {
    steps: Vec<Step>,
    current_index: usize,
    terminal_overwrite: TerminalOverwrite,
}

impl StepStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_terminal_overwrite(terminal_overwrite: TerminalOverwrite) -> Self {
        Self {
            terminal_overwrite,
            ..Self::default()
        }
    }

    pub fn terminal_overwrite(&self) -> TerminalOverwrite {
        self.terminal_overwrite
    }

    /// Replace the step list. All steps start `pending`, then the first one
    /// is marked `in_progress`.
    pub fn start_operation(&mut self, steps: impl IntoIterator<Item = StepDefinition>) {
        self.steps = steps.into_iter().map(Step::from).collect();
        self.current_index = 0;

        if let Some(first) = self.steps.first_mut() {
            first.status = StepStatus::InProgress;
            first.timestamp = Some(Utc::now());
        }
    }

    /// Merge `patch` into the step with `step_id`. Returns `false` if no
    /// such step exists.
    ///
    /// A status the transition rules refuse is skipped; the remaining fields
    /// of the patch are still applied.
    pub fn update_step(&mut self, step_id: &str, patch: StepPatch) -> bool {
        let policy = self.terminal_overwrite;
        let Some(step) = self.steps.iter_mut().find(|s| s.id == step_id) else {
            debug!(step_id, "ignoring update for unknown step");
            return false;
        };

        if let Some(status) = patch.status {
            if transition_allowed(step.status, status, policy) {
                step.status = status;
            } else {
                debug!(
                    step_id,
                    from = %step.status,
                    to = %status,
                    "refusing step status transition"
                );
            }
        }
        if let Some(message) = patch.message {
            step.message = Some(message);
        }
        if let Some(progress) = patch.server_progress {
            step.server_progress = Some(progress);
        }
        if let Some(message) = patch.server_message {
            step.server_message = Some(message);
        }
        step.timestamp = Some(patch.timestamp.unwrap_or_else(Utc::now));

        true
    }

    pub fn complete_step(&mut self, step_id: &str, message: Option<String>) -> bool {
        self.finish_step(step_id, StepStatus::Completed, message)
    }

    pub fn error_step(&mut self, step_id: &str, message: Option<String>) -> bool {
        self.finish_step(step_id, StepStatus::Error, message)
    }

    fn finish_step(&mut self, step_id: &str, status: StepStatus, message: Option<String>) -> bool {
        let patch = StepPatch {
            status: Some(status),
            message,
            ..StepPatch::default()
        };
        self.update_step(step_id, patch)
    }

    /// Advance the pointer and mark the step it lands on as `in_progress`.
    ///
    /// The previous step is left as is. Past the last step only the pointer
    /// moves (up to `len`).
    pub fn next_step(&mut self) -> Option<&Step> {
        if self.current_index < self.steps.len() {
            self.current_index += 1;
        }

        let index = self.current_index;
        let id = self.steps.get(index)?.id.clone();
        self.update_step(&id, StepPatch::new().status(StepStatus::InProgress));
        self.steps.get(index)
    }

    /// Drop all steps and reset the pointer
    pub fn close(&mut self) {
        self.steps.clear();
        self.current_index = 0;
    }

    /// Percentage of completed steps, 0 when there are none
    pub fn overall_progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let completed = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        completed as f64 / self.steps.len() as f64 * 100.0
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn get(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn current_step_index(&self) -> usize {
        self.current_index
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.steps.get(self.current_index)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// True when every step reached a terminal status
    pub fn is_finished(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.status.is_terminal())
    }
}

/// Statuses only move forward: pending -> in_progress -> terminal.
fn transition_allowed(from: StepStatus, to: StepStatus, policy: TerminalOverwrite) -> bool {
    if from == to {
        return true;
    }
    match (from, to) {
        (_, StepStatus::Pending) => false,
        (StepStatus::Completed | StepStatus::Error, StepStatus::InProgress) => false,
        (StepStatus::Completed | StepStatus::Error, _) => policy == TerminalOverwrite::Allow,
        _ => true,
    }
}
