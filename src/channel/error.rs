use thiserror::Error;

/// Errors raised by a socket transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("failed to send frame: {0}")]
    Send(String),
}

/// Errors surfaced by `RealtimeChannel::connect`.
///
/// The same text is recorded in `ChannelState::connection_error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("no user identity available")]
    IdentityUnavailable,

    #[error("invalid endpoint '{0}': {1}")]
    InvalidEndpoint(String, String),
}
