//! Progress coordinator: the single entry point for callers.
//!
//! Binds one `RealtimeChannel` to one `StepStateStore` for the lifetime of a
//! session and exposes the merged read model. Server updates and local calls
//! end up in the same store transitions.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use crate::channel::{identity, Connector, IdentityProvider, RealtimeChannel, WsConnector};
use crate::config::Config;
use crate::steps::StepStateStore;
use crate::types::{ProgressUpdate, Step, StepDefinition, StepPatch, StepStatus};

/// Session lifecycle: `Idle -> Active -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,
    Active,
    Closed,
}

/// Read model for the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressView {
    pub is_visible: bool,
    pub phase: SessionPhase,
    pub operation_id: Option<String>,
    pub steps: Vec<Step>,
    pub current_step: usize,
    pub overall_progress: f64,
    pub is_websocket_connected: bool,
    pub websocket_error: Option<String>,
    pub last_update: Option<ProgressUpdate>,
}

pub struct ProgressCoordinator {
    store: StepStateStore,
    channel: RealtimeChannel,
    updates: mpsc::UnboundedReceiver<ProgressUpdate>,
    operation_id: Option<String>,
    last_update: Option<ProgressUpdate>,
    phase: SessionPhase,
    is_visible: bool,
}

impl ProgressCoordinator {
    pub fn new(
        config: &Config,
        connector: Arc<dyn Connector>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let (tx, updates) = mpsc::unbounded_channel();
        Self {
            store: StepStateStore::with_terminal_overwrite(config.progress.terminal_overwrite),
            channel: RealtimeChannel::new(&config.channel, connector, identity, tx),
            updates,
            operation_id: None,
            last_update: None,
            phase: SessionPhase::Idle,
            is_visible: false,
        }
    }

    /// Coordinator using a real WebSocket and the configured identity source
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config,
            Arc::new(WsConnector),
            identity::from_config(&config.identity),
        )
    }

    /// Start tracking `operation_id`.
    ///
    /// Steps are initialized before this returns, so local transitions can be
    /// issued right away; the socket may still be connecting. Any previous
    /// session is discarded first.
    #[instrument(skip(self, steps))]
    pub async fn start_operation(
        &mut self,
        operation_id: &str,
        steps: impl IntoIterator<Item = StepDefinition>,
    ) {
        if self.phase == SessionPhase::Active {
            debug!(previous = ?self.operation_id, "replacing active session");
            self.channel.stop_operation();
        }
        self.discard_queued();

        self.store.start_operation(steps);
        self.operation_id = Some(operation_id.to_string());
        self.last_update = None;
        self.phase = SessionPhase::Active;
        self.is_visible = true;

        self.channel.start_operation(operation_id).await;
        info!(steps = self.store.steps().len(), "operation session started");
    }

    /// Apply every update queued by the channel without waiting.
    /// Returns how many changed a step.
    pub fn apply_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(update) = self.updates.try_recv() {
            if self.route_update(update) {
                applied += 1;
            }
        }
        applied
    }

    /// Wait for the next update from the channel and apply it. Returns
    /// whether it changed a step.
    ///
    /// Returns `false` right away when no session is active, and once the
    /// connection task has stopped and nothing is left in the queue.
    pub async fn wait_for_update(&mut self) -> bool {
        if self.operation_id.is_none() {
            return false;
        }

        let update = tokio::select! {
            update = self.updates.recv() => update,
            () = self.channel.stopped() => None,
        };
        match update.or_else(|| self.updates.try_recv().ok()) {
            Some(update) => self.route_update(update),
            None => false,
        }
    }

    /// Translate a server update into store transitions
    fn route_update(&mut self, update: ProgressUpdate) -> bool {
        let Some(active) = self.operation_id.as_deref() else {
            return false;
        };
        if !update.belongs_to(active) {
            debug!(operation_id = %update.operation_id, "ignoring update for stale operation");
            return false;
        }
        self.last_update = Some(update.clone());

        let mut patch = StepPatch::new()
            .status(update.status)
            .stamped(update.timestamp.unwrap_or_else(Utc::now));
        if let Some(message) = &update.message {
            patch = patch.server_message(message.clone());
        }
        if let Some(progress) = update.progress {
            patch = patch.server_progress(progress);
        }
        if !self.store.update_step(&update.step, patch) {
            return false;
        }

        // A status the store refused must not pick up the server's message
        let accepted = self
            .store
            .get(&update.step)
            .is_some_and(|step| step.status == update.status);
        if !accepted {
            return true;
        }

        match update.status {
            StepStatus::Completed => {
                self.store.complete_step(&update.step, update.message);
            }
            StepStatus::Error => {
                self.store.error_step(&update.step, update.message);
            }
            StepStatus::Pending | StepStatus::InProgress => {}
        }
        true
    }

    pub fn update_step(&mut self, step_id: &str, patch: StepPatch) -> bool {
        self.store.update_step(step_id, patch.stamped(Utc::now()))
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

    /// Advance to the next step and mark it `in_progress`
    pub fn next_step(&mut self) -> Option<&Step> {
        self.store.next_step()
    }

    /// End the session: stop the operation on the server, tear down the
    /// channel and clear all state. Safe to call repeatedly.
    #[instrument(skip(self))]
    pub async fn close_modal(&mut self) {
        self.channel.stop_operation();
        self.channel.cleanup().await;
        self.discard_queued();

        self.store.close();
        self.operation_id = None;
        self.last_update = None;
        self.is_visible = false;
        if self.phase == SessionPhase::Active {
            self.phase = SessionPhase::Closed;
            info!("operation session closed");
        }
    }

    /// Drop updates still queued from a previous session
    fn discard_queued(&mut self) {
        let mut dropped = 0;
        while self.updates.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "discarded queued updates");
        }
    }

    pub fn view(&self) -> ProgressView {
        let channel = self.channel.state();
        ProgressView {
            is_visible: self.is_visible,
            phase: self.phase,
            operation_id: self.operation_id.clone(),
            steps: self.store.steps().to_vec(),
            current_step: self.store.current_step_index(),
            overall_progress: self.store.overall_progress(),
            is_websocket_connected: channel.connected,
            websocket_error: channel.connection_error,
            last_update: self.last_update.clone(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn operation_id(&self) -> Option<&str> {
        self.operation_id.as_deref()
    }

    pub fn store(&self) -> &StepStateStore {
        &self.store
    }

    pub fn channel(&self) -> &RealtimeChannel {
        &self.channel
    }
}
