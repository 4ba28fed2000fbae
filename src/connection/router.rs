// ABOUTME: Message routing registry with per-callback isolation
// Every frame and state transition fans out to the routers of its connection

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::{error, warn};
use uuid::Uuid;

use crate::protocol::{Frame, FrameKind};

use super::id::ConnectionId;
use super::state::ConnectionState;

/// What a router receives: wire frames and connection lifecycle changes.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Frame(Frame),
    State(ConnectionState),
}

type Handler = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&str) + Send + Sync>;

/// A registered callback for one connection. Frame-kind filters narrow
/// which frames it sees; state events are always delivered.
pub struct Router {
    route_id: Uuid,
    kinds: Option<Vec<FrameKind>>,
    handler: Handler,
    on_error: Option<ErrorHook>,
}

impl Router {
    pub fn new(handler: impl Fn(&ChannelEvent) + Send + Sync + 'static) -> Self {
        Self {
            route_id: Uuid::new_v4(),
            kinds: None,
            handler: Arc::new(handler),
            on_error: None,
        }
    }

    pub fn with_kinds(mut self, kinds: &[FrameKind]) -> Self {
        self.kinds = Some(kinds.to_vec());
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn route_id(&self) -> Uuid {
        self.route_id
    }

    fn wants(&self, event: &ChannelEvent) -> bool {
        match (&self.kinds, event) {
            (Some(kinds), ChannelEvent::Frame(frame)) => kinds.contains(&frame.kind()),
            _ => true,
        }
    }
}

#[derive(Default)]
pub(crate) struct RouterRegistry {
    routes: Mutex<HashMap<ConnectionId, Vec<Router>>>,
}

impl RouterRegistry {
    pub fn register(&self, id: &ConnectionId, router: Router) -> Uuid {
        let route_id = router.route_id;
        let mut routes = self.routes.lock().expect("router registry lock poisoned");
        routes.entry(id.clone()).or_default().push(router);
        route_id
    }

    pub fn remove(&self, id: &ConnectionId, route_id: Uuid) {
        let mut routes = self.routes.lock().expect("router registry lock poisoned");
        if let Some(list) = routes.get_mut(id) {
            list.retain(|r| r.route_id != route_id);
            if list.is_empty() {
                routes.remove(id);
            }
        }
    }

    pub fn clear(&self) {
        self.routes.lock().expect("router registry lock poisoned").clear();
    }

    /// Dispatch to every router registered for the connection. A panicking
    /// callback is caught and logged so it cannot starve the rest.
    pub fn dispatch(&self, id: &ConnectionId, event: &ChannelEvent) {
        let targets: Vec<(Uuid, Handler, Option<ErrorHook>)> = {
            let routes = self.routes.lock().expect("router registry lock poisoned");
            match routes.get(id) {
                Some(list) => list
                    .iter()
                    .filter(|r| r.wants(event))
                    .map(|r| (r.route_id, Arc::clone(&r.handler), r.on_error.clone()))
                    .collect(),
                None => return,
            }
        };

        for (route_id, handler, on_error) in targets {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
            if outcome.is_err() {
                error!(connection = %id, route = %route_id, "router callback panicked");
                if let Some(hook) = on_error {
                    let hook_outcome =
                        catch_unwind(AssertUnwindSafe(|| hook("router callback panicked")));
                    if hook_outcome.is_err() {
                        warn!(connection = %id, route = %route_id, "router error hook panicked");
                    }
                }
            }
        }
    }

    pub fn route_count(&self, id: &ConnectionId) -> usize {
        self.routes
            .lock()
            .expect("router registry lock poisoned")
            .get(id)
            .map_or(0, Vec::len)
    }

    pub fn total_routes(&self) -> usize {
        self.routes
            .lock()
            .expect("router registry lock poisoned")
            .values()
            .map(Vec::len)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::id::SharedChannel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn a_panicking_router_does_not_block_the_rest() {
        let registry = RouterRegistry::default();
        let id = ConnectionId::shared(SharedChannel::Metrics);

        let delivered = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let errors_hook = Arc::clone(&errors);
        registry.register(
            &id,
            Router::new(|_| panic!("subscriber bug")).on_error(move |_| {
                errors_hook.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let delivered_clone = Arc::clone(&delivered);
        registry.register(
            &id,
            Router::new(move |_| {
                delivered_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        registry.dispatch(&id, &ChannelEvent::Frame(Frame::Ping));

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn kind_filters_apply_to_frames_but_not_state_events() {
        let registry = RouterRegistry::default();
        let id = ConnectionId::shared(SharedChannel::Events);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        registry.register(
            &id,
            Router::new(move |_| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            })
            .with_kinds(&[FrameKind::Event]),
        );

        registry.dispatch(&id, &ChannelEvent::Frame(Frame::Ping));
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        registry.dispatch(
            &id,
            &ChannelEvent::Frame(Frame::Event {
                payload: serde_json::json!({"kind": "vm-started"}),
            }),
        );
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        registry.dispatch(&id, &ChannelEvent::State(ConnectionState::Open));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn remove_drops_only_the_named_route() {
        let registry = RouterRegistry::default();
        let id = ConnectionId::shared(SharedChannel::Metrics);

        let first = registry.register(&id, Router::new(|_| {}));
        registry.register(&id, Router::new(|_| {}));
        assert_eq!(registry.route_count(&id), 2);

        registry.remove(&id, first);
        assert_eq!(registry.route_count(&id), 1);
    }
}
