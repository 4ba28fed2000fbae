// ABOUTME: Error types for the connection subsystem
// Defines error conditions for socket lifecycle, routing, and queuing

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication rejected by server")]
    Auth,

    #[error("malformed frame: {0}")]
    Protocol(String),

    #[error("connect attempt timed out after {0}ms")]
    ConnectTimeout(u64),

    #[error("outbound queue full for {0}")]
    QueueOverflow(String),

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),
}

impl ConnectionError {
    /// Whether the manager may schedule a reconnection after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectionError::Network(_) | ConnectionError::ConnectTimeout(_)
        )
    }
}
