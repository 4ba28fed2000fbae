// ABOUTME: In-memory transport for tests and offline development
// Hands the server end of every accepted socket to the test harness

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ConnectionError;
use crate::protocol::Frame;

use super::{Connector, Socket};

/// Connector that fabricates socket pairs instead of dialing a network.
/// Every successful `connect` emits a [`ServerEnd`] on the channel returned
/// by [`MemoryConnector::new`], which scripts the server side.
pub struct MemoryConnector {
    state: Arc<ConnectorState>,
}

struct ConnectorState {
    accepted: mpsc::UnboundedSender<ServerEnd>,
    fail_next: AtomicU32,
    attempts: AtomicU64,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepted, accepted_rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::new(ConnectorState {
                    accepted,
                    fail_next: AtomicU32::new(0),
                    attempts: AtomicU64::new(0),
                }),
            },
            accepted_rx,
        )
    }

    /// Make the next `n` connect attempts fail with a network error.
    pub fn fail_next(&self, n: u32) {
        self.state.fail_next.store(n, Ordering::SeqCst);
    }

    /// Total connect attempts seen, successful or not.
    pub fn attempts(&self) -> u64 {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub fn handle(&self) -> MemoryConnector {
        MemoryConnector {
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Socket>, ConnectionError> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.state.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(ConnectionError::Network(format!(
                "simulated connect failure to {url}"
            )));
        }

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();

        // A dropped harness receiver is fine: the client end still works,
        // the server side is simply unobserved.
        let _ = self.state.accepted.send(ServerEnd {
            url: url.to_string(),
            tx: server_tx,
            rx: server_rx,
        });

        Ok(Box::new(MemorySocket {
            tx: Some(client_tx),
            rx: client_rx,
        }))
    }
}

struct MemorySocket {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Socket for MemorySocket {
    async fn send(&mut self, text: &str) -> Result<(), ConnectionError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| ConnectionError::Network("socket closed".to_string()))?;
        tx.send(text.to_string())
            .map_err(|_| ConnectionError::Network("peer closed the socket".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, ConnectionError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}

/// The scripted server side of one accepted in-memory socket.
pub struct ServerEnd {
    pub url: String,
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl ServerEnd {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.tx.send(text.into()).is_ok()
    }

    pub fn send_frame(&self, frame: &Frame) -> bool {
        self.send_text(frame.to_text())
    }

    /// Next raw text the client sent, or `None` once the client closed.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub async fn recv_frame(&mut self) -> Option<Frame> {
        let text = self.recv_text().await?;
        Frame::parse(&text).ok()
    }

    /// Non-blocking drain of everything the client has sent so far.
    pub fn drain_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(text) = self.rx.try_recv() {
            if let Ok(frame) = Frame::parse(&text) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Drop the server side, which the client observes as an unexpected
    /// close.
    pub fn hang_up(self) {}
}
