// ABOUTME: Connection subsystem: socket lifecycle, reconnection, routing
// The manager multiplexes shared broadcast channels and isolated
// per-resource connections over one transport seam

pub mod events;
pub mod health;
pub mod id;
pub mod manager;
pub mod queue;
pub mod reconnect;
pub mod router;
pub mod state;

pub use events::subscribe_to_events_channel;
pub use health::ConnectionHealth;
pub use id::{ConnectionId, IsolatedKind, SharedChannel};
pub use manager::{ConnectionManager, EventStream, IsolatedConfig, RouterHandle, Subscription};
pub use queue::QueuedMessage;
pub use reconnect::ReconnectStrategy;
pub use router::{ChannelEvent, Router};
pub use state::{ConnectionSnapshot, ConnectionState};
