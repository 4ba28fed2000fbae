// ABOUTME: Terminal session store multiplexing sessions over isolated connections
// A session outlives any single connection: scrollback and the emulator
// survive disconnects so the session can be reattached with history intact

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{
    ChannelEvent, ConnectionId, ConnectionManager, ConnectionState, IsolatedKind, Router,
    RouterHandle,
};
use crate::error::ConnectionError;
use crate::protocol::{Frame, FrameKind};

use super::emulator::TerminalEmulator;
use super::surface::TerminalSurface;

/// Raw output chunks retained per session for replay on reattach.
const SCROLLBACK_CHUNK_LIMIT: usize = 1_000;

/// How long a connect waits for the socket to open before reporting failure.
const CONNECT_WAIT: Duration = Duration::from_secs(10);

const DEFAULT_SHELL: &str = "/bin/bash";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl SessionConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionConnectionStatus::Connecting => "connecting",
            SessionConnectionStatus::Connected => "connected",
            SessionConnectionStatus::Disconnected => "disconnected",
        }
    }
}

/// Observable view of one session, for UIs and the validator.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: String,
    pub name: String,
    pub status: SessionConnectionStatus,
    pub cols: u16,
    pub rows: u16,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub has_emulator: bool,
    pub has_surface: bool,
    pub scrollback_chunks: usize,
}

struct TerminalSession {
    id: String,
    name: String,
    status: SessionConnectionStatus,
    emulator: Option<TerminalEmulator>,
    scrollback: VecDeque<String>,
    cols: u16,
    rows: u16,
    created_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
    surface: Option<Weak<dyn TerminalSurface>>,
    resize_task: Option<JoinHandle<()>>,
    input_task: Option<JoinHandle<()>>,
    router: Option<RouterHandle>,
}

impl TerminalSession {
    fn new(id: String, name: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            status: SessionConnectionStatus::Connecting,
            emulator: None,
            scrollback: VecDeque::new(),
            cols: 80,
            rows: 24,
            created_at: now,
            last_active_at: now,
            surface: None,
            resize_task: None,
            input_task: None,
            router: None,
        }
    }

    fn abort_tasks(&mut self) {
        if let Some(task) = self.resize_task.take() {
            task.abort();
        }
        if let Some(task) = self.input_task.take() {
            task.abort();
        }
    }

    fn push_scrollback(&mut self, chunk: &str) {
        self.scrollback.push_back(chunk.to_string());
        while self.scrollback.len() > SCROLLBACK_CHUNK_LIMIT {
            self.scrollback.pop_front();
        }
    }
}

/// The terminal session store. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    manager: ConnectionManager,
    sessions: Mutex<HashMap<String, TerminalSession>>,
    active_session: Mutex<Option<String>>,
    counter: AtomicU64,
}

impl SessionStore {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                manager,
                sessions: Mutex::new(HashMap::new()),
                active_session: Mutex::new(None),
                counter: AtomicU64::new(0),
            }),
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    /// Create a session record in `Connecting` state. Opening the actual
    /// connection is a separate, explicit step.
    pub fn create_session(&self, name: Option<String>) -> String {
        let counter = self.inner.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let session_id = format!("session-{counter}");
        let session_name = name.unwrap_or_else(|| format!("Terminal {counter}"));

        info!(session = %session_id, name = %session_name, "creating terminal session");
        {
            let mut sessions = lock(&self.inner.sessions);
            sessions.insert(
                session_id.clone(),
                TerminalSession::new(session_id.clone(), session_name),
            );
        }
        *lock(&self.inner.active_session) = Some(session_id.clone());

        session_id
    }

    /// Attach a session to a render surface: build the emulator if needed,
    /// replay retained scrollback into it, watch the surface for resizes,
    /// forward its keystrokes, and connect if the session is disconnected.
    pub async fn initialize_terminal(
        &self,
        session_id: &str,
        surface: &Arc<dyn TerminalSurface>,
    ) -> Result<(), ConnectionError> {
        let needs_connect = {
            let mut sessions = lock(&self.inner.sessions);
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| ConnectionError::SessionNotFound(session_id.to_string()))?;

            if session.emulator.is_none() {
                let mut emulator = TerminalEmulator::new(session.cols, session.rows);
                for chunk in &session.scrollback {
                    emulator.process_output(chunk);
                }
                session.emulator = Some(emulator);
            }

            session.abort_tasks();
            session.surface = Some(Arc::downgrade(surface));

            let store = arc_downgrade(&self.inner);
            let resize_id = session_id.to_string();
            let mut resize_rx = surface.resized();
            session.resize_task = Some(tokio::spawn(async move {
                while resize_rx.changed().await.is_ok() {
                    let (cols, rows) = *resize_rx.borrow_and_update();
                    let Some(inner) = store.upgrade() else { break };
                    SessionStore { inner }.fit_to(&resize_id, cols, rows);
                }
            }));

            let store = arc_downgrade(&self.inner);
            let input_id = session_id.to_string();
            let mut input_rx = surface.input();
            session.input_task = Some(tokio::spawn(async move {
                loop {
                    match input_rx.recv().await {
                        Ok(data) => {
                            let Some(inner) = store.upgrade() else { break };
                            SessionStore { inner }.send_input(&input_id, &data);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(session = %input_id, skipped, "dropped lagged terminal input");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));

            session.status != SessionConnectionStatus::Connected
        };

        // Initial fit to the surface's current geometry.
        let (cols, rows) = surface.size();
        self.fit_to(session_id, cols, rows);

        if needs_connect {
            self.connect_session(session_id).await?;
        }
        Ok(())
    }

    /// Open the session's isolated connection and perform the terminal
    /// handshake once the socket is up.
    pub async fn connect_session(&self, session_id: &str) -> Result<(), ConnectionError> {
        {
            let mut sessions = lock(&self.inner.sessions);
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| ConnectionError::SessionNotFound(session_id.to_string()))?;
            session.status = SessionConnectionStatus::Connecting;
            // The previous connection's router, if any, must not double-fire.
            session.router = None;
        }

        let connection_id = ConnectionId::isolated(IsolatedKind::Terminals, session_id);
        let handle = self
            .inner
            .manager
            .register_router(&connection_id, self.session_router(session_id, &connection_id));
        {
            let mut sessions = lock(&self.inner.sessions);
            if let Some(session) = sessions.get_mut(session_id) {
                session.router = Some(handle);
            }
        }

        self.inner
            .manager
            .create_isolated(IsolatedKind::Terminals, session_id, None);

        match self
            .inner
            .manager
            .wait_until_open(&connection_id, CONNECT_WAIT)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(session = %session_id, error = %e, "terminal connect failed");
                let mut sessions = lock(&self.inner.sessions);
                if let Some(session) = sessions.get_mut(session_id) {
                    session.status = SessionConnectionStatus::Disconnected;
                }
                Err(e)
            }
        }
    }

    /// Router receiving the session's frames and connection state. Holds
    /// only weak references so a registered router never keeps the store
    /// alive.
    fn session_router(&self, session_id: &str, connection_id: &ConnectionId) -> Router {
        let store = arc_downgrade(&self.inner);
        let session_id = session_id.to_string();
        let connection_id = connection_id.clone();

        Router::new(move |event| {
            let Some(inner) = store.upgrade() else { return };
            match event {
                ChannelEvent::Frame(Frame::Output { payload }) => {
                    let mut sessions = lock(&inner.sessions);
                    if let Some(session) = sessions.get_mut(&session_id) {
                        if let Some(emulator) = &mut session.emulator {
                            emulator.process_output(&payload.data);
                        }
                        session.push_scrollback(&payload.data);
                        session.last_active_at = Utc::now();
                    }
                }
                ChannelEvent::Frame(Frame::Error { payload }) => {
                    warn!(session = %session_id, error = %payload.message, "terminal error");
                    let mut sessions = lock(&inner.sessions);
                    if let Some(session) = sessions.get_mut(&session_id) {
                        session.status = SessionConnectionStatus::Disconnected;
                    }
                }
                ChannelEvent::State(state) => {
                    let handshake = {
                        let mut sessions = lock(&inner.sessions);
                        match sessions.get_mut(&session_id) {
                            Some(session) => match state {
                                ConnectionState::Open => {
                                    session.status = SessionConnectionStatus::Connected;
                                    session.last_active_at = Utc::now();
                                    Some((session.cols, session.rows))
                                }
                                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                                    session.status = SessionConnectionStatus::Connecting;
                                    None
                                }
                                ConnectionState::Closing | ConnectionState::Closed => {
                                    session.status = SessionConnectionStatus::Disconnected;
                                    None
                                }
                            },
                            None => None,
                        }
                    };

                    // Handshake on every open, so reconnects renegotiate
                    // geometry too.
                    if let Some((cols, rows)) = handshake {
                        let manager = inner.manager.clone();
                        let _ = manager.send(
                            &connection_id,
                            Frame::subscribe_terminal(cols, rows, DEFAULT_SHELL),
                        );
                    }
                }
                ChannelEvent::Frame(_) => {}
            }
        })
        .with_kinds(&[FrameKind::Output, FrameKind::Error, FrameKind::Complete])
    }

    /// Close only the connection. The emulator, its scrollback, and the
    /// surface attachment stay so the session can reattach with history.
    pub fn disconnect_session(&self, session_id: &str) {
        let existed = {
            let mut sessions = lock(&self.inner.sessions);
            match sessions.get_mut(session_id) {
                Some(session) => {
                    session.router = None;
                    true
                }
                None => false,
            }
        };
        if !existed {
            return;
        }

        self.inner
            .manager
            .close_isolated(IsolatedKind::Terminals, session_id);

        let mut sessions = lock(&self.inner.sessions);
        if let Some(session) = sessions.get_mut(session_id) {
            session.status = SessionConnectionStatus::Disconnected;
            info!(session = %session_id, "session disconnected");
        }
    }

    /// Full teardown of one session: connection, emulator, watchers, and
    /// the record itself.
    pub fn close_session(&self, session_id: &str) {
        let removed = {
            let mut sessions = lock(&self.inner.sessions);
            sessions.remove(session_id)
        };
        let Some(mut session) = removed else {
            return;
        };

        session.router = None;
        session.abort_tasks();
        session.emulator = None;
        session.surface = None;

        self.inner
            .manager
            .close_isolated(IsolatedKind::Terminals, session_id);

        // Keep the active tab pointing at something real.
        let next = {
            let sessions = lock(&self.inner.sessions);
            sessions.keys().next().cloned()
        };
        {
            let mut active = lock(&self.inner.active_session);
            if active.as_deref() == Some(session_id) {
                *active = next;
            }
        }

        info!(session = %session_id, "session closed");
    }

    /// Forward keystrokes when connected; otherwise drop them. Offline
    /// keystrokes are never queued: replaying stale input is unsafe.
    pub fn send_input(&self, session_id: &str, data: &str) {
        let connection_id = {
            let sessions = lock(&self.inner.sessions);
            match sessions.get(session_id) {
                Some(session) if session.status == SessionConnectionStatus::Connected => {
                    ConnectionId::isolated(IsolatedKind::Terminals, session_id)
                }
                Some(_) => {
                    debug!(session = %session_id, "dropping input while not connected");
                    return;
                }
                None => return,
            }
        };

        let _ = self.inner.manager.send(&connection_id, Frame::input(data));
    }

    /// Fit the emulator to the attached surface's current size.
    pub fn fit_terminal(&self, session_id: &str) {
        let size = {
            let sessions = lock(&self.inner.sessions);
            sessions
                .get(session_id)
                .and_then(|s| s.surface.as_ref())
                .and_then(Weak::upgrade)
                .map(|surface| surface.size())
        };
        if let Some((cols, rows)) = size {
            self.fit_to(session_id, cols, rows);
        }
    }

    fn fit_to(&self, session_id: &str, cols: u16, rows: u16) {
        let resize_connection = {
            let mut sessions = lock(&self.inner.sessions);
            let Some(session) = sessions.get_mut(session_id) else {
                return;
            };
            session.cols = cols;
            session.rows = rows;
            if let Some(emulator) = &mut session.emulator {
                emulator.resize(cols, rows);
            }
            (session.status == SessionConnectionStatus::Connected)
                .then(|| ConnectionId::isolated(IsolatedKind::Terminals, session_id))
        };

        if let Some(connection_id) = resize_connection {
            let _ = self
                .inner
                .manager
                .send(&connection_id, Frame::resize(cols, rows));
        }
    }

    pub fn focus_terminal(&self, session_id: &str) {
        {
            let mut sessions = lock(&self.inner.sessions);
            if let Some(session) = sessions.get_mut(session_id) {
                session.last_active_at = Utc::now();
            }
        }
        *lock(&self.inner.active_session) = Some(session_id.to_string());
    }

    pub fn clear_terminal(&self, session_id: &str) {
        let mut sessions = lock(&self.inner.sessions);
        if let Some(session) = sessions.get_mut(session_id) {
            if let Some(emulator) = &mut session.emulator {
                emulator.clear();
            }
            session.scrollback.clear();
        }
    }

    pub fn set_selection(&self, session_id: &str, start: (u16, u16), end: (u16, u16)) {
        let mut sessions = lock(&self.inner.sessions);
        if let Some(emulator) = sessions.get_mut(session_id).and_then(|s| s.emulator.as_mut()) {
            emulator.start_selection(start.0, start.1);
            emulator.update_selection(end.0, end.1);
        }
    }

    pub fn clear_selection(&self, session_id: &str) {
        let mut sessions = lock(&self.inner.sessions);
        if let Some(emulator) = sessions.get_mut(session_id).and_then(|s| s.emulator.as_mut()) {
            emulator.clear_selection();
        }
    }

    pub fn selection(&self, session_id: &str) -> Option<String> {
        let sessions = lock(&self.inner.sessions);
        sessions
            .get(session_id)
            .and_then(|s| s.emulator.as_ref())
            .and_then(TerminalEmulator::selected_text)
    }

    pub fn scroll_to_top(&self, session_id: &str) {
        let mut sessions = lock(&self.inner.sessions);
        if let Some(emulator) = sessions.get_mut(session_id).and_then(|s| s.emulator.as_mut()) {
            emulator.scroll_to_top();
        }
    }

    pub fn scroll_to_bottom(&self, session_id: &str) {
        let mut sessions = lock(&self.inner.sessions);
        if let Some(emulator) = sessions.get_mut(session_id).and_then(|s| s.emulator.as_mut()) {
            emulator.scroll_to_bottom();
        }
    }

    pub fn rename_session(&self, session_id: &str, new_name: impl Into<String>) {
        let mut sessions = lock(&self.inner.sessions);
        if let Some(session) = sessions.get_mut(session_id) {
            session.name = new_name.into();
        }
    }

    /// Drop the surface attachment (navigating away) without disposing the
    /// emulator.
    pub fn detach_terminal(&self, session_id: &str) {
        let mut sessions = lock(&self.inner.sessions);
        if let Some(session) = sessions.get_mut(session_id) {
            session.abort_tasks();
            session.surface = None;
        }
    }

    /// Text contents of the session's live screen, if an emulator exists.
    pub fn screen_contents(&self, session_id: &str) -> Option<String> {
        let sessions = lock(&self.inner.sessions);
        sessions
            .get(session_id)
            .and_then(|s| s.emulator.as_ref())
            .map(TerminalEmulator::screen_contents)
    }

    pub fn session_snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        let sessions = lock(&self.inner.sessions);
        sessions.get(session_id).map(snapshot_of)
    }

    pub fn session_snapshots(&self) -> Vec<SessionSnapshot> {
        let sessions = lock(&self.inner.sessions);
        let mut list: Vec<SessionSnapshot> = sessions.values().map(snapshot_of).collect();
        list.sort_by_key(|s| s.created_at);
        list
    }

    pub fn active_session_id(&self) -> Option<String> {
        lock(&self.inner.active_session).clone()
    }

    pub fn connected_count(&self) -> usize {
        let sessions = lock(&self.inner.sessions);
        sessions
            .values()
            .filter(|s| s.status == SessionConnectionStatus::Connected)
            .count()
    }

    pub fn session_count(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    /// Global teardown at application shutdown or logout.
    pub fn dispose(&self) {
        info!("disposing all terminal sessions");
        let ids: Vec<String> = {
            let sessions = lock(&self.inner.sessions);
            sessions.keys().cloned().collect()
        };
        for id in ids {
            self.close_session(&id);
        }
        *lock(&self.inner.active_session) = None;
        self.inner.counter.store(0, Ordering::SeqCst);
    }
}

fn snapshot_of(session: &TerminalSession) -> SessionSnapshot {
    SessionSnapshot {
        id: session.id.clone(),
        name: session.name.clone(),
        status: session.status,
        cols: session.cols,
        rows: session.rows,
        created_at: session.created_at,
        last_active_at: session.last_active_at,
        has_emulator: session.emulator.is_some(),
        has_surface: session
            .surface
            .as_ref()
            .is_some_and(|weak| weak.upgrade().is_some()),
        scrollback_chunks: session.scrollback.len(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().expect("session store lock poisoned")
}

fn arc_downgrade(inner: &Arc<StoreInner>) -> Weak<StoreInner> {
    Arc::downgrade(inner)
}
