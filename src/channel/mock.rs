//! Scripted in-memory transport for tests.
//!
//! Each `connect` call consumes the next scripted outcome. Once the script is
//! exhausted every further attempt fails with "connection refused".

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

use super::error::TransportError;
use super::transport::{Connector, Socket, SocketEvent};
use crate::types::ProgressUpdate;

/// Mock implementation for testing
#[derive(Default)]
pub struct MockConnector {
    script: Mutex<VecDeque<MockOutcome>>,
    attempts: Mutex<Vec<MockAttempt>>,
}

/// A recorded connection attempt
#[derive(Debug, Clone)]
pub struct MockAttempt {
    pub url: String,
    pub at: Instant,
}

enum MockOutcome {
    Fail(String),
    Accept(MockSocket),
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next attempt to fail
    pub fn fail_next(&self, reason: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(MockOutcome::Fail(reason.to_string()));
    }

    /// Script the next attempt to succeed; the returned handle plays the server
    pub fn accept_next(&self) -> MockServer {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed_with = Arc::new(Mutex::new(None));

        self.script
            .lock()
            .unwrap()
            .push_back(MockOutcome::Accept(MockSocket {
                inbound: inbound_rx,
                sent: sent.clone(),
                closed_with: closed_with.clone(),
            }));

        MockServer {
            inbound: inbound_tx,
            sent,
            closed_with,
        }
    }

    pub fn attempts(&self) -> Vec<MockAttempt> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Socket>, TransportError> {
        self.attempts.lock().unwrap().push(MockAttempt {
            url: url.to_string(),
            at: Instant::now(),
        });

        let outcome = self.script.lock().unwrap().pop_front();
        match outcome {
            Some(MockOutcome::Accept(socket)) => Ok(Box::new(socket)),
            Some(MockOutcome::Fail(reason)) => Err(TransportError::Connect {
                url: url.to_string(),
                reason,
            }),
            None => Err(TransportError::Connect {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            }),
        }
    }
}

/// Client side of a scripted connection
struct MockSocket {
    inbound: mpsc::UnboundedReceiver<SocketEvent>,
    sent: Arc<Mutex<Vec<String>>>,
    closed_with: Arc<Mutex<Option<u16>>>,
}

#[async_trait]
impl Socket for MockSocket {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if self.closed_with.lock().unwrap().is_some() {
            return Err(TransportError::Send("socket closed".to_string()));
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn recv(&mut self) -> Option<SocketEvent> {
        self.inbound.recv().await
    }

    async fn close(&mut self, code: u16) {
        *self.closed_with.lock().unwrap() = Some(code);
    }
}

/// Server side of a scripted connection.
///
/// Dropping it ends the client's stream, which the channel sees as an
/// abnormal close.
pub struct MockServer {
    inbound: mpsc::UnboundedSender<SocketEvent>,
    sent: Arc<Mutex<Vec<String>>>,
    closed_with: Arc<Mutex<Option<u16>>>,
}

impl MockServer {
    pub fn push_text(&self, text: &str) {
        let _ = self.inbound.send(SocketEvent::Text(text.to_string()));
    }

    pub fn push_update(&self, update: &ProgressUpdate) {
        let text = serde_json::to_string(update).unwrap_or_default();
        self.push_text(&text);
    }

    pub fn push_error(&self, error: &str) {
        let _ = self.inbound.send(SocketEvent::Error(error.to_string()));
    }

    pub fn close(&self, code: Option<u16>) {
        let _ = self.inbound.send(SocketEvent::Closed { code });
    }

    /// Frames the client sent, in order
    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Close code the client used, if it closed the socket
    pub fn closed_with(&self) -> Option<u16> {
        *self.closed_with.lock().unwrap()
    }
}
