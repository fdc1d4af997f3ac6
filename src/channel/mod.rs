//! Realtime progress channel.
//!
//! `RealtimeChannel` owns at most one socket connection, reconnects it with
//! exponential back-off after abnormal closes, and forwards only the updates
//! that belong to the operation currently of interest.
//!
//! The socket itself lives in a background task (`driver`); the handle talks
//! to it through a command queue and shares `ChannelState` with it. Accepted
//! updates are pushed to the `mpsc` sender given at construction.

pub mod backoff;
mod driver;
pub mod error;
pub mod identity;
pub mod mock;
pub mod state;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use error::{ChannelError, TransportError};
pub use identity::{EnvIdentity, IdentityProvider, StaticIdentity};
pub use mock::{MockConnector, MockServer};
pub use state::ChannelState;
pub use transport::{Connector, Socket, SocketEvent, WsConnector};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::ChannelConfig;
use crate::types::{ControlMessage, ProgressUpdate};
use driver::{Command, ConnectionDriver};
use state::SharedState;

struct DriverHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

pub struct RealtimeChannel {
    endpoint: String,
    policy: ReconnectPolicy,
    shutdown_timeout: Duration,
    connector: Arc<dyn Connector>,
    identity: Arc<dyn IdentityProvider>,
    state: SharedState,
    updates: mpsc::UnboundedSender<ProgressUpdate>,
    driver: Option<DriverHandle>,
}

impl RealtimeChannel {
    pub fn new(
        config: &ChannelConfig,
        connector: Arc<dyn Connector>,
        identity: Arc<dyn IdentityProvider>,
        updates: mpsc::UnboundedSender<ProgressUpdate>,
    ) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            policy: ReconnectPolicy::from(config),
            shutdown_timeout: config.shutdown_timeout(),
            connector,
            identity,
            state: SharedState::default(),
            updates,
            driver: None,
        }
    }

    /// Open the connection unless an attempt is already pending or open.
    ///
    /// Connection failures after this point are retried in the background and
    /// reported through `connection_error`; only a missing identity or a bad
    /// endpoint fail here.
    #[instrument(skip(self))]
    pub async fn connect(&mut self) -> Result<(), ChannelError> {
        if self.is_running() {
            return Ok(());
        }

        let Some(user_id) = self.identity.user_id().await else {
            return Err(self.fail(ChannelError::IdentityUnavailable));
        };
        let url = match endpoint_url(&self.endpoint, &user_id) {
            Ok(url) => url,
            Err(err) => return Err(self.fail(err)),
        };

        {
            let mut state = self.state.lock();
            state.connection_error = None;
            state.reconnect_attempts = 0;
        }

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let driver = ConnectionDriver::new(
            url,
            self.connector.clone(),
            self.policy,
            self.state.clone(),
            self.updates.clone(),
            commands_rx,
        );
        let task = tokio::spawn(driver.run());
        self.driver = Some(DriverHandle { commands, task });

        info!(endpoint = %self.endpoint, "progress channel starting");
        Ok(())
    }

    /// Scope delivery to `operation_id` and announce it to the server once
    /// the socket is open.
    #[instrument(skip(self))]
    pub async fn start_operation(&mut self, operation_id: &str) {
        {
            let mut state = self.state.lock();
            state.active_operation_id = Some(operation_id.to_string());
            state.last_update = None;
        }

        if self.is_running() {
            self.send_command(Command::Announce);
        } else if let Err(err) = self.connect().await {
            warn!(error = %err, "progress channel unavailable");
        }
    }

    /// Tell the server to stop streaming the active operation (best effort)
    /// and stop delivering its updates.
    pub fn stop_operation(&mut self) {
        let (connected, operation_id) = {
            let mut state = self.state.lock();
            (state.connected, state.clear_operation())
        };

        if let (true, Some(operation_id)) = (connected, operation_id) {
            self.send_command(Command::Send(ControlMessage::stop(operation_id)));
        }
    }

    /// Cancel any pending reconnect, close the socket cleanly and reset all
    /// state. Safe to call more than once.
    #[instrument(skip(self))]
    pub async fn cleanup(&mut self) {
        if let Some(driver) = self.driver.take() {
            let _ = driver.commands.send(Command::Shutdown);
            let mut task = driver.task;
            if !task.is_finished()
                && tokio::time::timeout(self.shutdown_timeout, &mut task)
                    .await
                    .is_err()
            {
                warn!("progress channel did not stop in time, aborting");
                task.abort();
            }
            debug!("progress channel cleaned up");
        }

        *self.state.lock() = ChannelState::default();
    }

    /// Snapshot of the channel state
    pub fn state(&self) -> ChannelState {
        self.state.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn connection_error(&self) -> Option<String> {
        self.state.lock().connection_error.clone()
    }

    pub fn last_update(&self) -> Option<ProgressUpdate> {
        self.state.lock().last_update.clone()
    }

    pub fn active_operation_id(&self) -> Option<String> {
        self.state.lock().active_operation_id.clone()
    }

    /// Whether a connection task is pending, open or backing off
    pub fn is_running(&self) -> bool {
        self.driver
            .as_ref()
            .is_some_and(|driver| !driver.task.is_finished())
    }

    /// Resolves once the connection task has exited. Resolves immediately
    /// when no task was ever started.
    pub async fn stopped(&mut self) {
        if let Some(driver) = &mut self.driver {
            if !driver.task.is_finished() {
                let _ = (&mut driver.task).await;
            }
        }
    }

    fn send_command(&self, command: Command) {
        if let Some(driver) = &self.driver {
            if driver.commands.send(command).is_err() {
                debug!("progress channel driver already stopped");
            }
        }
    }

    fn fail(&self, err: ChannelError) -> ChannelError {
        warn!(error = %err, "progress channel cannot connect");
        let mut state = self.state.lock();
        state.connected = false;
        state.connection_error = Some(err.to_string());
        err
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.task.abort();
        }
    }
}

/// `<endpoint>?userId=<id>`
fn endpoint_url(endpoint: &str, user_id: &str) -> Result<Url, ChannelError> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| ChannelError::InvalidEndpoint(endpoint.to_string(), e.to_string()))?;
    url.query_pairs_mut().append_pair("userId", user_id);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StepStatus;
    use tokio::time::Instant;

    fn channel_with(
        connector: &Arc<MockConnector>,
        identity: StaticIdentity,
    ) -> (RealtimeChannel, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = RealtimeChannel::new(
            &ChannelConfig::default(),
            connector.clone(),
            Arc::new(identity),
            tx,
        );
        (channel, rx)
    }

    /// Let the connection task run without advancing the clock
    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    fn update_json(operation_id: &str, step: &str, status: &str) -> String {
        format!(r#"{{"operation_id":"{operation_id}","step":"{step}","status":"{status}","message":"m","progress":50}}"#)
    }

    #[test]
    fn test_endpoint_url() {
        let url = endpoint_url("wss://ops.example.com/ws/progress", "user 42").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://ops.example.com/ws/progress?userId=user+42"
        );
        assert!(matches!(
            endpoint_url("not a url", "u"),
            Err(ChannelError::InvalidEndpoint(_, _))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_identity_fails_fast() {
        let connector = Arc::new(MockConnector::new());
        let (mut channel, _rx) = channel_with(&connector, StaticIdentity::anonymous());

        assert_eq!(
            channel.connect().await,
            Err(ChannelError::IdentityUnavailable)
        );
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(connector.attempt_count(), 0);
        assert!(!channel.is_running());
        assert!(!channel.is_connected());
        assert_eq!(
            channel.connection_error().as_deref(),
            Some("no user identity available")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_opens_socket_with_user_id() {
        let connector = Arc::new(MockConnector::new());
        let _server = connector.accept_next();
        let (mut channel, _rx) = channel_with(&connector, StaticIdentity::new("u-1"));

        channel.connect().await.unwrap();
        settle().await;

        assert!(channel.is_connected());
        assert!(channel.connection_error().is_none());
        assert_eq!(
            connector.attempts()[0].url,
            "wss://localhost/ws/progress?userId=u-1"
        );

        // A second connect while open is a no-op
        channel.connect().await.unwrap();
        settle().await;
        assert_eq!(connector.attempt_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_operation_announces_and_filters() {
        let connector = Arc::new(MockConnector::new());
        let server = connector.accept_next();
        let (mut channel, mut rx) = channel_with(&connector, StaticIdentity::new("u-1"));

        channel.start_operation("op-1").await;
        settle().await;
        assert_eq!(
            server.sent_frames(),
            vec![r#"{"type":"start_operation","operation_id":"op-1"}"#.to_string()]
        );

        server.push_text(&update_json("other-op", "x", "completed"));
        server.push_text("garbage");
        server.push_text(&update_json("op-1", "s1", "in_progress"));
        settle().await;

        let update = rx.try_recv().unwrap();
        assert_eq!(update.step, "s1");
        assert_eq!(update.status, StepStatus::InProgress);
        assert!(rx.try_recv().is_err());
        assert_eq!(channel.last_update(), Some(update));
        assert!(channel.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_operation_twice_on_same_socket_announces_once() {
        let connector = Arc::new(MockConnector::new());
        let server = connector.accept_next();
        let (mut channel, _rx) = channel_with(&connector, StaticIdentity::new("u-1"));

        channel.start_operation("op-1").await;
        settle().await;
        channel.start_operation("op-1").await;
        settle().await;

        assert_eq!(server.sent_frames().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_operation_sends_stop_and_clears() {
        let connector = Arc::new(MockConnector::new());
        let server = connector.accept_next();
        let (mut channel, mut rx) = channel_with(&connector, StaticIdentity::new("u-1"));

        channel.start_operation("op-1").await;
        settle().await;
        server.push_text(&update_json("op-1", "s1", "completed"));
        settle().await;
        assert!(channel.last_update().is_some());

        channel.stop_operation();
        assert!(channel.active_operation_id().is_none());
        assert!(channel.last_update().is_none());
        settle().await;

        assert_eq!(
            server.sent_frames().last().map(String::as_str),
            Some(r#"{"type":"stop_operation","operation_id":"op-1"}"#)
        );

        // Updates after stop are no longer delivered
        let _ = rx.try_recv();
        server.push_text(&update_json("op-1", "s2", "completed"));
        settle().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_operation_while_disconnected_only_clears() {
        let connector = Arc::new(MockConnector::new());
        let (mut channel, _rx) = channel_with(&connector, StaticIdentity::anonymous());

        channel.start_operation("op-1").await;
        channel.stop_operation();

        assert!(channel.active_operation_id().is_none());
        assert!(!channel.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sequence_until_exhausted() {
        let connector = Arc::new(MockConnector::new());
        let (mut channel, _rx) = channel_with(&connector, StaticIdentity::new("u-1"));

        let start = Instant::now();
        channel.connect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 6);

        let gaps: Vec<u128> = attempts
            .windows(2)
            .map(|w| (w[1].at - w[0].at).as_millis())
            .collect();
        assert_eq!(gaps, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!((attempts[0].at - start).as_millis(), 0);

        let state = channel.state();
        assert!(!state.connected);
        assert_eq!(state.reconnect_attempts, 5);
        assert!(state
            .connection_error
            .unwrap()
            .contains("gave up after 5 reconnect attempts"));
        assert!(!channel.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_reconnect_scheduled_after_abnormal_close() {
        let connector = Arc::new(MockConnector::new());
        connector.fail_next("refused");
        connector.fail_next("refused");
        let server = connector.accept_next();
        let (mut channel, _rx) = channel_with(&connector, StaticIdentity::new("u-1"));

        channel.connect().await.unwrap();
        // Initial attempt, then reconnects at +1000 and +2000 (the last one opens)
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(channel.is_connected());
        assert_eq!(channel.state().reconnect_attempts, 0);

        // Pretend two reconnects were already spent on this connection
        channel.state.lock().reconnect_attempts = 2;
        let closed_at = Instant::now();
        server.close(Some(4000));
        settle().await;

        assert!(!channel.is_connected());
        assert_eq!(channel.state().reconnect_attempts, 3);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 4);
        assert_eq!((attempts[3].at - closed_at).as_millis(), 4000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_reannounces_operation() {
        let connector = Arc::new(MockConnector::new());
        let first = connector.accept_next();
        let second = connector.accept_next();
        let (mut channel, _rx) = channel_with(&connector, StaticIdentity::new("u-1"));

        channel.start_operation("op-1").await;
        settle().await;
        first.push_error("connection reset");
        first.close(None);
        settle().await;
        assert!(!channel.is_connected());
        assert_eq!(channel.connection_error().as_deref(), Some("connection reset"));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(channel.is_connected());
        assert!(channel.connection_error().is_none());
        assert_eq!(
            second.sent_frames(),
            vec![r#"{"type":"start_operation","operation_id":"op-1"}"#.to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_server_close_does_not_reconnect() {
        let connector = Arc::new(MockConnector::new());
        let server = connector.accept_next();
        let (mut channel, _rx) = channel_with(&connector, StaticIdentity::new("u-1"));

        channel.connect().await.unwrap();
        settle().await;
        server.close(Some(1000));
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(connector.attempt_count(), 1);
        assert!(!channel.is_connected());
        assert!(channel.connection_error().is_none());
        assert!(!channel.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_resolves_when_connection_task_exits() {
        let connector = Arc::new(MockConnector::new());
        let server = connector.accept_next();
        let (mut channel, _rx) = channel_with(&connector, StaticIdentity::new("u-1"));

        // Nothing started yet
        channel.stopped().await;

        channel.connect().await.unwrap();
        settle().await;
        let waiting = tokio::time::timeout(Duration::from_secs(5), channel.stopped()).await;
        assert!(waiting.is_err());

        server.close(Some(1000));
        let stopped = tokio::time::timeout(Duration::from_secs(5), channel.stopped()).await;
        assert!(stopped.is_ok());
        assert!(!channel.is_running());

        channel.stopped().await;
        channel.cleanup().await;
        assert_eq!(channel.state(), ChannelState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_closes_socket_cleanly_and_resets() {
        let connector = Arc::new(MockConnector::new());
        let server = connector.accept_next();
        let (mut channel, _rx) = channel_with(&connector, StaticIdentity::new("u-1"));

        channel.start_operation("op-1").await;
        settle().await;
        channel.cleanup().await;

        assert_eq!(server.closed_with(), Some(1000));
        assert_eq!(channel.state(), ChannelState::default());
        assert!(!channel.is_running());

        channel.cleanup().await;
        assert_eq!(channel.state(), ChannelState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_cancels_pending_reconnect() {
        let connector = Arc::new(MockConnector::new());
        let (mut channel, _rx) = channel_with(&connector, StaticIdentity::new("u-1"));

        channel.connect().await.unwrap();
        settle().await;
        assert_eq!(connector.attempt_count(), 1);
        assert_eq!(channel.state().reconnect_attempts, 1);

        channel.cleanup().await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(connector.attempt_count(), 1);
        assert_eq!(channel.state(), ChannelState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_after_exhaustion_starts_fresh() {
        let connector = Arc::new(MockConnector::new());
        let (mut channel, _rx) = channel_with(&connector, StaticIdentity::new("u-1"));

        channel.connect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!channel.is_running());

        let _server = connector.accept_next();
        channel.connect().await.unwrap();
        settle().await;

        assert_eq!(connector.attempt_count(), 7);
        assert!(channel.is_connected());
        assert_eq!(channel.state().reconnect_attempts, 0);
    }
}
