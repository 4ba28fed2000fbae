// ABOUTME: Connection manager with a hybrid connection strategy
// Shared refcounted channels for broadcast data, isolated sockets for
// interactive features; owns reconnection, queuing, routing, health checks

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::AuthGate;
use crate::config::Config;
use crate::error::ConnectionError;
use crate::protocol::Frame;
use crate::transport::Connector;

use super::health::ConnectionHealth;
use super::id::{ConnectionId, IsolatedKind, SharedChannel};
use super::queue::MessageQueue;
use super::reconnect::ReconnectStrategy;
use super::router::{ChannelEvent, Router, RouterRegistry};
use super::state::{ConnectionSnapshot, ConnectionState};

/// Per-connection overrides for [`ConnectionManager::create_isolated`].
#[derive(Debug, Clone, Default)]
pub struct IsolatedConfig {
    /// Extra query parameters appended to the endpoint URL.
    pub params: Vec<(String, String)>,
    /// Strategy override; defaults to the category strategy from [`Config`].
    pub strategy: Option<ReconnectStrategy>,
}

/// The connection manager. Cheap to clone; all clones share state.
/// Constructed explicitly by the application root and torn down with
/// [`ConnectionManager::close_all`] on logout.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    connector: Arc<dyn Connector>,
    auth: Arc<dyn AuthGate>,
    config: Config,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    routers: RouterRegistry,
    queues: Mutex<HashMap<ConnectionId, MessageQueue>>,
}

struct Connection {
    url: String,
    endpoint: String,
    strategy: ReconnectStrategy,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    driver: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
    attempts: u32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    message_count: u64,
}

impl Connection {
    fn new(url: String, endpoint: String, strategy: ReconnectStrategy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let now = Utc::now();
        Self {
            url,
            endpoint,
            strategy,
            state: ConnectionState::Connecting,
            state_tx,
            outbound: None,
            driver: None,
            reconnect_timer: None,
            health_task: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            last_activity_at: now,
            message_count: 0,
        }
    }

    fn set_state(&mut self, state: ConnectionState) -> bool {
        if self.state == state {
            return false;
        }
        self.state = state;
        let _ = self.state_tx.send(state);
        true
    }
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, auth: Arc<dyn AuthGate>, config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                auth,
                config,
                connections: Mutex::new(HashMap::new()),
                routers: RouterRegistry::default(),
                queues: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakManager {
        WeakManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe to a shared broadcast channel.
    ///
    /// The channel's socket opens lazily on the first subscriber and is
    /// reused for the rest; the registered router count is the reference
    /// count, and the socket closes when it reaches zero.
    pub fn subscribe_to_shared(&self, channel: SharedChannel, router: Router) -> Subscription {
        let id = ConnectionId::shared(channel);
        let route_id = self.inner.routers.register(&id, router);

        let needs_driver = {
            let mut connections = lock(&self.inner.connections);
            match connections.get_mut(&id) {
                Some(existing) => {
                    // A permanently closed channel gets a fresh attempt for
                    // the new subscriber (e.g. after re-authentication).
                    existing.state == ConnectionState::Closed
                        && existing.driver.is_none()
                        && existing.reconnect_timer.is_none()
                }
                None => {
                    let conn = Connection::new(
                        self.inner.config.url_for(&id),
                        self.inner.config.endpoint_path(&id),
                        self.inner.config.strategy_for(&id).clone(),
                    );
                    connections.insert(id.clone(), conn);
                    true
                }
            }
        };

        if needs_driver {
            debug!(connection = %id, "opening shared channel for first subscriber");
            spawn_driver(&self.inner, &id);
            spawn_health_task(&self.inner, &id);
        }

        Subscription {
            inner: Arc::downgrade(&self.inner),
            id,
            route_id,
            released: false,
        }
    }

    /// Register a router on any connection without refcount semantics.
    /// Used by isolated-connection consumers such as the session store.
    pub fn register_router(&self, id: &ConnectionId, router: Router) -> RouterHandle {
        let route_id = self.inner.routers.register(id, router);
        RouterHandle {
            inner: Arc::downgrade(&self.inner),
            id: id.clone(),
            route_id,
            released: false,
        }
    }

    /// Create an isolated connection for one resource. Any existing
    /// connection under the same `(kind, id)` key is closed first, so the
    /// call is idempotent with respect to key identity.
    pub fn create_isolated(
        &self,
        kind: IsolatedKind,
        resource_id: impl Into<String>,
        config: Option<IsolatedConfig>,
    ) -> ConnectionId {
        let id = ConnectionId::isolated(kind, resource_id);

        if close_connection(&self.inner, &id) {
            debug!(connection = %id, "replacing existing isolated connection");
        }

        let config = config.unwrap_or_default();
        let mut url = self.inner.config.url_for(&id);
        for (key, value) in &config.params {
            url.push_str(&format!("&{key}={value}"));
        }

        let strategy = config
            .strategy
            .unwrap_or_else(|| self.inner.config.strategy_for(&id).clone());

        {
            let mut connections = lock(&self.inner.connections);
            connections.insert(
                id.clone(),
                Connection::new(url, self.inner.config.endpoint_path(&id), strategy),
            );
        }

        info!(connection = %id, "creating isolated connection");
        spawn_driver(&self.inner, &id);
        if kind.is_long_lived() {
            spawn_health_task(&self.inner, &id);
        }

        id
    }

    /// Close an isolated connection. Idempotent; cancels any pending
    /// reconnect timer and health interval, clears the outbound queue, and
    /// routes a terminal `Closed` state to registered routers.
    pub fn close_isolated(&self, kind: IsolatedKind, resource_id: &str) {
        let id = ConnectionId::isolated(kind, resource_id);
        if close_connection(&self.inner, &id) {
            info!(connection = %id, "closed isolated connection");
        }
    }

    /// Close a shared channel socket regardless of subscriber count.
    /// Registered routers survive; a later subscribe reopens the socket.
    pub fn close_shared(&self, channel: SharedChannel) {
        let id = ConnectionId::shared(channel);
        if close_connection(&self.inner, &id) {
            info!(connection = %id, "closed shared channel");
        }
    }

    /// Send a frame. If the socket is open the frame goes out immediately;
    /// otherwise it is queued, and a reconnection is triggered when none is
    /// already scheduled.
    pub fn send(&self, id: &ConnectionId, frame: Frame) -> Result<(), ConnectionError> {
        let queued_state = {
            let mut connections = lock(&self.inner.connections);
            let entry = connections
                .get_mut(id)
                .ok_or_else(|| ConnectionError::UnknownConnection(id.to_string()))?;

            if entry.state.is_open() {
                if let Some(outbound) = &entry.outbound {
                    if outbound.send(frame.to_text()).is_ok() {
                        return Ok(());
                    }
                }
                // Driver is gone mid-transition; fall through to the queue.
            }
            (entry.state, entry.reconnect_timer.is_some())
        };

        let dropped = {
            let mut queues = lock(&self.inner.queues);
            let queue = queues
                .entry(id.clone())
                .or_insert_with(|| MessageQueue::new(self.inner.config.max_queue_len));
            queue.push(frame)
        };
        if dropped.is_some() {
            warn!(connection = %id, "outbound queue full, dropped oldest message");
        }

        let (state, timer_armed) = queued_state;
        if state == ConnectionState::Closed && !timer_armed {
            schedule_reconnection(&self.inner, id);
        }

        Ok(())
    }

    pub fn connection_snapshot(&self, id: &ConnectionId) -> Option<ConnectionSnapshot> {
        let connections = lock(&self.inner.connections);
        connections.get(id).map(|entry| ConnectionSnapshot {
            id: id.clone(),
            endpoint: entry.endpoint.clone(),
            state: entry.state,
            last_error: entry.last_error.clone(),
            reconnect_attempts: entry.attempts,
            created_at: entry.created_at,
            last_activity_at: entry.last_activity_at,
            message_count: entry.message_count,
        })
    }

    /// Manual reconnect: bypasses any pending backoff timer and attempts
    /// immediately. The retry counter is not reset; only a successful open
    /// does that.
    pub fn reconnect(&self, id: &ConnectionId) -> Result<(), ConnectionError> {
        let (old_driver, old_timer) = {
            let mut connections = lock(&self.inner.connections);
            let entry = connections
                .get_mut(id)
                .ok_or_else(|| ConnectionError::UnknownConnection(id.to_string()))?;
            (entry.driver.take(), entry.reconnect_timer.take())
        };
        if let Some(driver) = old_driver {
            driver.abort();
        }
        if let Some(timer) = old_timer {
            timer.abort();
        }

        info!(connection = %id, "manual reconnect");
        spawn_driver(&self.inner, id);
        Ok(())
    }

    /// Wait until the connection reaches `Open`, or fail on permanent close
    /// or timeout.
    pub async fn wait_until_open(
        &self,
        id: &ConnectionId,
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        let mut state_rx = {
            let connections = lock(&self.inner.connections);
            connections
                .get(id)
                .ok_or_else(|| ConnectionError::UnknownConnection(id.to_string()))?
                .state_tx
                .subscribe()
        };

        let wait = async {
            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    ConnectionState::Open => return Ok(()),
                    ConnectionState::Closed => {
                        return Err(ConnectionError::NotConnected(id.to_string()))
                    }
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(ConnectionError::NotConnected(id.to_string()));
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ConnectionError::ConnectTimeout(timeout.as_millis() as u64))?
    }

    /// Deterministic teardown: every socket closed, every timer and health
    /// interval aborted, every queue and router registration dropped.
    /// Idempotent; used on logout.
    pub fn close_all(&self) {
        info!("closing all connections");

        let ids: Vec<ConnectionId> = {
            let connections = lock(&self.inner.connections);
            connections.keys().cloned().collect()
        };
        for id in &ids {
            close_connection(&self.inner, id);
        }

        lock(&self.inner.connections).clear();
        lock(&self.inner.queues).clear();
        self.inner.routers.clear();
    }

    pub fn health(&self) -> Vec<ConnectionHealth> {
        let connections = lock(&self.inner.connections);
        connections
            .iter()
            .map(|(id, entry)| ConnectionHealth {
                connection_id: id.clone(),
                state: entry.state,
                reconnect_count: entry.attempts,
                last_error: entry.last_error.clone(),
            })
            .collect()
    }

    /// Connections currently open, for status indicators.
    pub fn active_connections(&self) -> usize {
        let connections = lock(&self.inner.connections);
        connections.values().filter(|c| c.state.is_open()).count()
    }

    pub fn total_connections(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    /// Reconnect timers currently armed. Diagnostic.
    pub fn pending_reconnects(&self) -> usize {
        let connections = lock(&self.inner.connections);
        connections
            .values()
            .filter(|c| c.reconnect_timer.is_some())
            .count()
    }

    /// Routers currently registered across all connections. Diagnostic.
    pub fn registered_routes(&self) -> usize {
        self.inner.routers.total_routes()
    }

    pub fn queued_messages(&self, id: &ConnectionId) -> usize {
        lock(&self.inner.queues).get(id).map_or(0, MessageQueue::len)
    }
}

/// Weak handle used inside router callbacks so they never keep the manager
/// alive.
#[derive(Clone)]
pub(crate) struct WeakManager {
    inner: Weak<Inner>,
}

impl WeakManager {
    pub fn upgrade(&self) -> Option<ConnectionManager> {
        self.inner.upgrade().map(|inner| ConnectionManager { inner })
    }
}

/// Guard for one shared-channel subscription. Unsubscribes on
/// [`Subscription::unsubscribe`] or drop; the last subscriber closes the
/// socket.
pub struct Subscription {
    inner: Weak<Inner>,
    id: ConnectionId,
    route_id: Uuid,
    released: bool,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        inner.routers.remove(&self.id, self.route_id);
        if inner.routers.route_count(&self.id) == 0 {
            debug!(connection = %self.id, "last subscriber left, closing shared channel");
            close_connection(&inner, &self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// Guard for a plain router registration. Removed on
/// [`RouterHandle::remove`] or drop; carries no refcount semantics.
pub struct RouterHandle {
    inner: Weak<Inner>,
    id: ConnectionId,
    route_id: Uuid,
    released: bool,
}

impl RouterHandle {
    pub fn remove(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(inner) = self.inner.upgrade() {
            inner.routers.remove(&self.id, self.route_id);
        }
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Stream of [`ChannelEvent`]s for one connection. The registration is
/// dropped with the stream.
pub struct EventStream {
    _handle: RouterHandle,
    receiver: tokio_stream::wrappers::UnboundedReceiverStream<ChannelEvent>,
}

impl tokio_stream::Stream for EventStream {
    type Item = ChannelEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<ChannelEvent>> {
        std::pin::Pin::new(&mut self.receiver).poll_next(cx)
    }
}

impl ConnectionManager {
    /// Consume a connection's frames and state changes as an async stream
    /// instead of a callback router.
    pub fn event_stream(&self, id: &ConnectionId) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.register_router(
            id,
            Router::new(move |event| {
                let _ = tx.send(event.clone());
            }),
        );
        EventStream {
            _handle: handle,
            receiver: tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
        }
    }
}

// ============================================
// Internals
// ============================================

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().expect("connection manager lock poisoned")
}

/// Close one connection and remove it from the registry. Returns whether an
/// entry existed. Routers are notified of the terminal `Closed` state but
/// stay registered.
fn close_connection(inner: &Arc<Inner>, id: &ConnectionId) -> bool {
    let handles = {
        let mut connections = lock(&inner.connections);
        let Some(mut entry) = connections.remove(id) else {
            return false;
        };
        entry.set_state(ConnectionState::Closing);
        entry.set_state(ConnectionState::Closed);
        (
            entry.driver.take(),
            entry.reconnect_timer.take(),
            entry.health_task.take(),
        )
    };

    let (driver, timer, health) = handles;
    if let Some(handle) = driver {
        handle.abort();
    }
    if let Some(handle) = timer {
        handle.abort();
    }
    if let Some(handle) = health {
        handle.abort();
    }

    lock(&inner.queues).remove(id);
    inner
        .routers
        .dispatch(id, &ChannelEvent::State(ConnectionState::Closed));
    true
}

/// Mark a connection permanently closed, drop its queue, and route an
/// error frame plus the terminal state to subscribers. The entry stays in
/// the registry so a manual `reconnect` can revive it.
fn fail_permanently(inner: &Arc<Inner>, id: &ConnectionId, reason: &str) {
    let existed = {
        let mut connections = lock(&inner.connections);
        match connections.get_mut(id) {
            Some(entry) => {
                entry.last_error = Some(reason.to_string());
                entry.outbound = None;
                entry.driver = None;
                entry.set_state(ConnectionState::Closed);
                true
            }
            None => false,
        }
    };
    if !existed {
        return;
    }

    lock(&inner.queues).remove(id);
    error!(connection = %id, reason, "connection permanently closed");
    inner
        .routers
        .dispatch(id, &ChannelEvent::Frame(Frame::error(reason)));
    inner
        .routers
        .dispatch(id, &ChannelEvent::State(ConnectionState::Closed));
}

/// Arm the backoff timer for a connection, replacing any existing timer.
/// Increments the attempt counter; exhausting the budget closes the
/// connection permanently instead.
fn schedule_reconnection(inner: &Arc<Inner>, id: &ConnectionId) {
    let scheduled = {
        let mut connections = lock(&inner.connections);
        let Some(entry) = connections.get_mut(id) else {
            return;
        };

        if let Some(timer) = entry.reconnect_timer.take() {
            timer.abort();
        }

        if !entry.strategy.allows_attempt(entry.attempts) {
            None
        } else {
            let delay = entry.strategy.delay_for(entry.attempts);
            entry.attempts += 1;
            entry.set_state(ConnectionState::Reconnecting);

            let timer_inner = Arc::downgrade(inner);
            let timer_id = id.clone();
            entry.reconnect_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Some(timer_inner) = timer_inner.upgrade() else {
                    return;
                };
                {
                    let mut connections = lock(&timer_inner.connections);
                    if let Some(entry) = connections.get_mut(&timer_id) {
                        entry.reconnect_timer = None;
                    } else {
                        return;
                    }
                }
                spawn_driver(&timer_inner, &timer_id);
            }));

            Some((delay, entry.attempts))
        }
    };

    match scheduled {
        Some((delay, attempt)) => {
            info!(connection = %id, attempt, delay_ms = delay.as_millis() as u64, "reconnection scheduled");
            inner
                .routers
                .dispatch(id, &ChannelEvent::State(ConnectionState::Reconnecting));
        }
        None => {
            warn!(connection = %id, "retry budget exhausted");
            fail_permanently(inner, id, "retry budget exhausted, manual reconnect required");
        }
    }
}

/// Spawn the driver task for a connection: connect with a bounded timeout,
/// then pump frames both ways until the socket dies.
fn spawn_driver(inner: &Arc<Inner>, id: &ConnectionId) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    {
        let mut connections = lock(&inner.connections);
        let Some(entry) = connections.get_mut(id) else {
            return;
        };
        if let Some(old) = entry.driver.take() {
            old.abort();
        }
        entry.outbound = Some(outbound_tx);
        entry.set_state(ConnectionState::Connecting);

        let task_inner = Arc::clone(inner);
        let task_id = id.clone();
        entry.driver = Some(tokio::spawn(async move {
            drive(task_inner, task_id, outbound_rx).await;
        }));
    }

    inner
        .routers
        .dispatch(id, &ChannelEvent::State(ConnectionState::Connecting));
}

async fn drive(
    inner: Arc<Inner>,
    id: ConnectionId,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
) {
    let (url, strategy) = {
        let connections = lock(&inner.connections);
        let Some(entry) = connections.get(&id) else {
            return;
        };
        (entry.url.clone(), entry.strategy.clone())
    };

    // Shared channels never open before the user is authenticated.
    if id.is_shared() && !inner.auth.is_authenticated() {
        warn!(connection = %id, "refusing to open shared channel before authentication");
        fail_permanently(&inner, &id, "not authenticated");
        return;
    }

    debug!(connection = %id, url, "connecting");
    let connected = tokio::time::timeout(strategy.connect_timeout(), inner.connector.connect(&url)).await;

    let mut socket = match connected {
        Err(_) => {
            warn!(connection = %id, timeout_ms = strategy.connect_timeout_ms, "connect attempt timed out");
            on_connection_lost(&inner, &id, "connect timeout");
            return;
        }
        Ok(Err(e)) => {
            warn!(connection = %id, error = %e, "connect attempt failed");
            on_connection_lost(&inner, &id, &e.to_string());
            return;
        }
        Ok(Ok(socket)) => socket,
    };

    // Open: reset the attempt counter, authenticate, flush the queue, then
    // tell subscribers.
    {
        let mut connections = lock(&inner.connections);
        let Some(entry) = connections.get_mut(&id) else {
            return;
        };
        entry.attempts = 0;
        entry.last_error = None;
        entry.last_activity_at = Utc::now();
        entry.set_state(ConnectionState::Open);
    }
    info!(connection = %id, "connection open");

    if inner.auth.is_authenticated() {
        if let Some(token) = inner.auth.token() {
            if let Err(e) = socket.send(&Frame::auth_token(token).to_text()).await {
                warn!(connection = %id, error = %e, "failed to send auth frame");
                on_connection_lost(&inner, &id, &e.to_string());
                return;
            }
        }
    }

    let queued = {
        let mut queues = lock(&inner.queues);
        queues.get_mut(&id).map(MessageQueue::drain).unwrap_or_default()
    };
    if !queued.is_empty() {
        debug!(connection = %id, count = queued.len(), "flushing queued messages");
    }
    for (index, message) in queued.iter().enumerate() {
        if let Err(e) = socket.send(&message.frame.to_text()).await {
            // Unsent messages go back to the front of the queue, in order,
            // to survive the next reconnect.
            let mut queues = lock(&inner.queues);
            let queue = queues
                .entry(id.clone())
                .or_insert_with(|| MessageQueue::new(inner.config.max_queue_len));
            let mut remaining: Vec<Frame> =
                queued[index..].iter().map(|m| m.frame.clone()).collect();
            remaining.extend(queue.drain().into_iter().map(|m| m.frame));
            for frame in remaining {
                queue.push(frame);
            }
            drop(queues);
            on_connection_lost(&inner, &id, &e.to_string());
            return;
        }
    }

    inner
        .routers
        .dispatch(&id, &ChannelEvent::State(ConnectionState::Open));

    let close_reason = loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(text) => {
                        if let Err(e) = socket.send(&text).await {
                            break Some(e.to_string());
                        }
                    }
                    // All senders dropped; connection is being torn down.
                    None => break None,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(text)) => {
                        {
                            let mut connections = lock(&inner.connections);
                            if let Some(entry) = connections.get_mut(&id) {
                                entry.last_activity_at = Utc::now();
                                entry.message_count += 1;
                            }
                        }
                        match Frame::parse(&text) {
                            Ok(Frame::Ping) => {
                                let _ = socket.send(&Frame::Pong.to_text()).await;
                            }
                            Ok(Frame::Pong) => {}
                            Ok(frame) => {
                                // Server-reported auth rejection is terminal.
                                if frame.auth_verdict() == Some(false) {
                                    error!(connection = %id, "server rejected authentication");
                                    socket.close().await;
                                    fail_permanently(&inner, &id, "authentication rejected");
                                    return;
                                }
                                inner.routers.dispatch(&id, &ChannelEvent::Frame(frame));
                            }
                            Err(e) => {
                                // One bad frame must not break the router.
                                warn!(connection = %id, error = %e, "dropping malformed frame");
                            }
                        }
                    }
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break Some("connection closed by peer".to_string()),
                }
            }
        }
    };

    socket.close().await;

    match close_reason {
        Some(reason) => {
            warn!(connection = %id, reason, "connection lost");
            on_connection_lost(&inner, &id, &reason);
        }
        None => {
            debug!(connection = %id, "driver shut down");
        }
    }
}

/// Unexpected close handling: record the error and hand the connection to
/// the reconnection scheduler, which enforces the retry budget.
fn on_connection_lost(inner: &Arc<Inner>, id: &ConnectionId, reason: &str) {
    {
        let mut connections = lock(&inner.connections);
        let Some(entry) = connections.get_mut(id) else {
            return;
        };
        entry.last_error = Some(reason.to_string());
        entry.outbound = None;
        entry.driver = None;
    }
    schedule_reconnection(inner, id);
}

/// Periodic liveness task: ping open connections and force-reconnect stale
/// ones.
fn spawn_health_task(inner: &Arc<Inner>, id: &ConnectionId) {
    let interval = inner.config.health_check_interval();
    let stale_after =
        chrono::Duration::milliseconds(inner.config.stale_after_ms as i64);

    let task_inner = Arc::downgrade(inner);
    let task_id = id.clone();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // skip the immediate first tick

        loop {
            ticker.tick().await;
            let Some(inner) = task_inner.upgrade() else {
                return;
            };

            let (ping_tx, stale) = {
                let connections = lock(&inner.connections);
                let Some(entry) = connections.get(&task_id) else {
                    return;
                };
                let ping_tx = if entry.state.is_open() {
                    entry.outbound.clone()
                } else {
                    None
                };
                let stale = entry.state.is_open()
                    && Utc::now() - entry.last_activity_at > stale_after;
                (ping_tx, stale)
            };

            if stale {
                warn!(connection = %task_id, "stale connection detected, reconnecting");
                let manager = ConnectionManager { inner };
                let _ = manager.reconnect(&task_id);
                continue;
            }

            if let Some(tx) = ping_tx {
                let _ = tx.send(Frame::Ping.to_text());
            }
        }
    });

    let mut connections = lock(&inner.connections);
    if let Some(entry) = connections.get_mut(id) {
        if let Some(old) = entry.health_task.replace(task) {
            old.abort();
        }
    } else {
        task.abort();
    }
}
