// ABOUTME: Typed subscription helper for sub-channels of the events socket
// Filters one channel out of the shared /ws/events stream and keeps the
// server-side subscription alive across reconnects

use serde_json::Value;

use crate::protocol::{Frame, FrameKind};

use super::id::SharedChannel;
use super::manager::{ConnectionManager, Subscription};
use super::router::{ChannelEvent, Router};
use super::state::ConnectionState;

/// Well-known events sub-channels.
pub const VM_EVENTS: &str = "vm-events";
pub const CONTAINER_EVENTS: &str = "container-events";
pub const K8S_EVENTS: &str = "k8s-events";

/// Subscribe to one sub-channel of the shared events socket.
///
/// The subscribe frame is sent immediately (queued until the socket opens)
/// and re-sent on every reconnect, so the server-side filter survives
/// connection churn. `on_connection_change` tracks the underlying socket.
pub fn subscribe_to_events_channel(
    manager: &ConnectionManager,
    channel: impl Into<String>,
    on_event: impl Fn(&Value) + Send + Sync + 'static,
    on_connection_change: Option<Box<dyn Fn(bool) + Send + Sync>>,
) -> Subscription {
    let channel = channel.into();
    let connection_id = super::id::ConnectionId::shared(SharedChannel::Events);

    let weak = manager.downgrade();
    let router_channel = channel.clone();
    let router_id = connection_id.clone();
    let router = Router::new(move |event| match event {
        ChannelEvent::Frame(Frame::Event { payload }) => on_event(payload),
        ChannelEvent::State(ConnectionState::Open) => {
            // Re-subscribe on every (re)connect.
            if let Some(manager) = weak.upgrade() {
                let _ = manager.send(&router_id, Frame::subscribe_channel(&router_channel));
            }
            if let Some(hook) = &on_connection_change {
                hook(true);
            }
        }
        ChannelEvent::State(_) => {
            if let Some(hook) = &on_connection_change {
                hook(false);
            }
        }
        ChannelEvent::Frame(_) => {}
    })
    .with_kinds(&[FrameKind::Event]);

    let subscription = manager.subscribe_to_shared(SharedChannel::Events, router);

    // Initial subscribe; the manager queues it until the socket is open.
    let _ = manager.send(&connection_id, Frame::subscribe_channel(&channel));

    subscription
}
