//! Connection task owning the socket for one `RealtimeChannel`.
//!
//! Loop: connect, pump socket events and handle commands until the socket
//! closes, then either sleep for the back-off delay and reconnect or stop.
//! A `Shutdown` command ends the loop at any point, including mid-back-off.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use super::backoff::ReconnectPolicy;
use super::error::TransportError;
use super::state::SharedState;
use super::transport::{Connector, Socket, SocketEvent, ABNORMAL_CLOSURE, NORMAL_CLOSURE};
use crate::types::{ControlMessage, ProgressUpdate};

/// Requests from the channel handle to its connection task
#[derive(Debug)]
pub(crate) enum Command {
    /// Send `start_operation` for the active operation unless this socket
    /// already announced it
    Announce,
    /// Send a control message if a socket is open, otherwise drop it
    Send(ControlMessage),
    /// Close the socket cleanly and exit
    Shutdown,
}

enum SessionEnd {
    Closed(u16),
    Shutdown,
}

pub(crate) struct ConnectionDriver {
    url: Url,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    state: SharedState,
    updates: mpsc::UnboundedSender<ProgressUpdate>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl ConnectionDriver {
    pub(crate) fn new(
        url: Url,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        state: SharedState,
        updates: mpsc::UnboundedSender<ProgressUpdate>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            url,
            connector,
            policy,
            state,
            updates,
            commands,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let code = match self.open_socket().await {
                Ok(Some(socket)) => match self.run_session(socket).await {
                    SessionEnd::Closed(code) => code,
                    SessionEnd::Shutdown => break,
                },
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "progress channel connection failed");
                    self.state.lock().on_error(err.to_string());
                    ABNORMAL_CLOSURE
                }
            };

            let delay = self.state.lock().on_close(code, &self.policy);
            match delay {
                Some(delay) => {
                    info!(code, ?delay, "progress channel closed, reconnecting");
                    if !self.wait_backoff(delay).await {
                        break;
                    }
                }
                None if code == NORMAL_CLOSURE => {
                    info!("progress channel closed cleanly");
                    break;
                }
                None => {
                    warn!(
                        attempts = self.policy.max_attempts,
                        "progress channel reconnect attempts exhausted"
                    );
                    break;
                }
            }
        }

        debug!("progress channel driver stopped");
    }

    /// Connect, staying responsive to `Shutdown`. `Ok(None)` means shut down.
    async fn open_socket(&mut self) -> Result<Option<Box<dyn Socket>>, TransportError> {
        debug!(url = %self.url, "connecting progress channel");
        let connect = self.connector.connect(&self.url);
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => return result.map(Some),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => return Ok(None),
                    // The active operation is announced once the socket opens
                    Some(command) => debug!(?command, "dropping command while connecting"),
                },
            }
        }
    }

    async fn run_session(&mut self, mut socket: Box<dyn Socket>) -> SessionEnd {
        self.state.lock().on_open();
        info!("progress channel connected");

        let mut announced: Option<String> = None;
        self.announce(socket.as_mut(), &mut announced).await;

        loop {
            tokio::select! {
                event = socket.recv() => match event {
                    Some(SocketEvent::Text(text)) => self.deliver(&text),
                    Some(SocketEvent::Error(err)) => {
                        warn!(error = %err, "progress channel error");
                        self.state.lock().on_error(err);
                    }
                    Some(SocketEvent::Closed { code }) => {
                        return SessionEnd::Closed(code.unwrap_or(ABNORMAL_CLOSURE));
                    }
                    None => return SessionEnd::Closed(ABNORMAL_CLOSURE),
                },
                command = self.commands.recv() => match command {
                    Some(Command::Announce) => self.announce(socket.as_mut(), &mut announced).await,
                    Some(Command::Send(message)) => {
                        if matches!(message, ControlMessage::StopOperation { .. }) {
                            announced = None;
                        }
                        if let Err(err) = socket.send(message.to_frame()).await {
                            warn!(error = %err, "failed to send control message");
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        socket.close(NORMAL_CLOSURE).await;
                        return SessionEnd::Shutdown;
                    }
                },
            }
        }
    }

    async fn announce(&self, socket: &mut dyn Socket, announced: &mut Option<String>) {
        let active = self.state.lock().active_operation_id.clone();
        let Some(operation_id) = active else {
            return;
        };
        if announced.as_deref() == Some(operation_id.as_str()) {
            return;
        }

        let frame = ControlMessage::start(operation_id.clone()).to_frame();
        match socket.send(frame).await {
            Ok(()) => {
                debug!(operation_id = %operation_id, "announced operation");
                *announced = Some(operation_id);
            }
            Err(err) => warn!(error = %err, "failed to announce operation"),
        }
    }

    fn deliver(&self, text: &str) {
        let accepted = self.state.lock().accept(text);
        if let Some(update) = accepted {
            if self.updates.send(update).is_err() {
                debug!("update receiver dropped");
            }
        }
    }

    /// Sleep before reconnecting. Returns `false` if shut down meanwhile.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => return false,
                    Some(command) => debug!(?command, "dropping command while disconnected"),
                },
            }
        }
    }
}
