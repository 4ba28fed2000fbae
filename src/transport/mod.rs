// ABOUTME: Transport capability traits abstracting the raw WebSocket
// Keeps the state machine, queueing, and backoff logic testable offline

pub mod memory;
pub mod tungstenite;

use async_trait::async_trait;

use crate::error::ConnectionError;

pub use memory::{MemoryConnector, ServerEnd};
pub use tungstenite::TungsteniteConnector;

/// One live socket. Text frames in, text frames out.
#[async_trait]
pub trait Socket: Send {
    async fn send(&mut self, text: &str) -> Result<(), ConnectionError>;

    /// Next inbound frame. `None` means the peer closed the socket.
    async fn recv(&mut self) -> Option<Result<String, ConnectionError>>;

    async fn close(&mut self);
}

/// Factory for sockets; the manager holds exactly one.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Socket>, ConnectionError>;
}
