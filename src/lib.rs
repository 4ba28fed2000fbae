// ABOUTME: Library crate for the conlink real-time connection subsystem
// WebSocket channel multiplexing, terminal sessions, and leak diagnostics
// for an operator console; the UI around it lives elsewhere

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod validate;

pub use auth::{AuthGate, StaticAuthGate};
pub use config::Config;
pub use connection::{
    subscribe_to_events_channel, ChannelEvent, ConnectionHealth, ConnectionId, ConnectionManager,
    ConnectionSnapshot, ConnectionState, EventStream, IsolatedConfig, IsolatedKind,
    ReconnectStrategy, Router, RouterHandle, SharedChannel, Subscription,
};
pub use error::ConnectionError;
pub use protocol::{Frame, FrameKind};
pub use session::{SessionConnectionStatus, SessionSnapshot, SessionStore, TerminalSurface};
pub use validate::{
    ConnectionValidator, LeakReport, ValidationResult, ValidationSummary, ValidatorConfig,
};
