//! Channel state and the transitions socket events drive on it.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use super::backoff::ReconnectPolicy;
use super::transport::NORMAL_CLOSURE;
use crate::types::ProgressUpdate;

/// Connection status as seen by the presentation layer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelState {
    pub connected: bool,
    pub connection_error: Option<String>,
    /// Operation whose updates are delivered; everything else is dropped
    pub active_operation_id: Option<String>,
    /// Reconnects made since the last successful open
    pub reconnect_attempts: u32,
    /// Last accepted update, kept for inspection only
    pub last_update: Option<ProgressUpdate>,
}

impl ChannelState {
    pub fn on_open(&mut self) {
        self.connected = true;
        self.connection_error = None;
        self.reconnect_attempts = 0;
    }

    /// Record an error. The socket stays up until its close arrives.
    pub fn on_error(&mut self, error: impl Into<String>) {
        self.connection_error = Some(error.into());
        self.connected = false;
    }

    /// Handle a close and decide whether to reconnect.
    ///
    /// Returns the delay before the next attempt, counting it, or `None` for
    /// a clean close or once the attempt budget is spent.
    pub fn on_close(&mut self, code: u16, policy: &ReconnectPolicy) -> Option<Duration> {
        self.connected = false;
        if code == NORMAL_CLOSURE {
            return None;
        }

        match policy.delay_for(self.reconnect_attempts) {
            Some(delay) => {
                self.reconnect_attempts += 1;
                Some(delay)
            }
            None => {
                let last = self
                    .connection_error
                    .take()
                    .unwrap_or_else(|| format!("connection closed with code {code}"));
                self.connection_error = Some(format!(
                    "gave up after {} reconnect attempts: {}",
                    self.reconnect_attempts, last
                ));
                None
            }
        }
    }

    /// Parse an inbound text frame and keep it if it belongs to the active
    /// operation. Malformed frames and foreign operations are dropped.
    pub fn accept(&mut self, text: &str) -> Option<ProgressUpdate> {
        let update = match ProgressUpdate::parse(text) {
            Ok(update) => update,
            Err(err) => {
                warn!(error = %err, "dropping malformed progress message");
                return None;
            }
        };

        let Some(active) = self.active_operation_id.as_deref() else {
            debug!(operation_id = %update.operation_id, "no active operation, dropping update");
            return None;
        };
        if !update.belongs_to(active) {
            debug!(
                operation_id = %update.operation_id,
                active,
                "dropping update for another operation"
            );
            return None;
        }

        self.last_update = Some(update.clone());
        Some(update)
    }

    /// Forget the active operation and its last update
    pub fn clear_operation(&mut self) -> Option<String> {
        self.last_update = None;
        self.active_operation_id.take()
    }
}

/// `ChannelState` shared between the channel handle and its connection task.
///
/// Guards are only held for short synchronous sections, never across `.await`.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedState(Arc<Mutex<ChannelState>>);

impl SharedState {
    pub(crate) fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn snapshot(&self) -> ChannelState {
        self.lock().clone()
    }
}
