// ABOUTME: Connection validation and leak detection for terminal sessions
// Compares each session's declared status against observed socket and
// emulator facts, and can self-heal orphaned connections

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::connection::{ConnectionId, ConnectionState, IsolatedKind};
use crate::session::{SessionConnectionStatus, SessionSnapshot, SessionStore};

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Disconnected sessions with a live emulator and no activity for this
    /// long draw a staleness warning.
    pub stale_warning_after: Duration,
    /// Disconnected sessions still holding resources after this long count
    /// as leaks.
    pub leak_after: Duration,
    /// Disconnected sessions inactive for this long are force-closed by
    /// cleanup.
    pub force_close_after: Duration,
    pub history_limit: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            stale_warning_after: Duration::from_secs(60),
            leak_after: Duration::from_secs(5 * 60),
            force_close_after: Duration::from_secs(10 * 60),
            history_limit: 100,
        }
    }
}

/// Observed facts about one session, independent of what the session says
/// about itself.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub session_id: String,
    pub name: String,
    pub is_socket_open: bool,
    pub socket_state: Option<ConnectionState>,
    pub has_terminal_instance: bool,
    pub has_surface: bool,
    pub connection_status: SessionConnectionStatus,
    pub last_active_at: DateTime<Utc>,
    pub validated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ValidationSummary {
    pub total_sessions: usize,
    pub active_connections: usize,
    pub orphaned_connections: usize,
    pub properly_closed_sessions: usize,
    pub sessions: Vec<ValidationResult>,
    pub warnings: Vec<String>,
    pub validated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct LeakReport {
    pub has_leaks: bool,
    pub details: Vec<String>,
}

/// Read-only diagnostic pass over the session store and its connections.
/// Cheap to clone; all clones share the monitoring timer and history.
#[derive(Clone)]
pub struct ConnectionValidator {
    inner: Arc<ValidatorInner>,
}

struct ValidatorInner {
    store: SessionStore,
    config: ValidatorConfig,
    history: Mutex<VecDeque<ValidationSummary>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionValidator {
    pub fn new(store: SessionStore) -> Self {
        Self::with_config(store, ValidatorConfig::default())
    }

    pub fn with_config(store: SessionStore, config: ValidatorConfig) -> Self {
        Self {
            inner: Arc::new(ValidatorInner {
                store,
                config,
                history: Mutex::new(VecDeque::new()),
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Observed facts for one session.
    pub fn validate_session(&self, session: &SessionSnapshot) -> ValidationResult {
        let connection_id = ConnectionId::isolated(IsolatedKind::Terminals, &session.id);
        let socket_state = self
            .inner
            .store
            .manager()
            .connection_snapshot(&connection_id)
            .map(|s| s.state);

        ValidationResult {
            session_id: session.id.clone(),
            name: session.name.clone(),
            is_socket_open: socket_state.is_some_and(|s| s.is_open()),
            socket_state,
            has_terminal_instance: session.has_emulator,
            has_surface: session.has_surface,
            connection_status: session.status,
            last_active_at: session.last_active_at,
            validated_at: Utc::now(),
        }
    }

    /// Validate every session and classify anomalies.
    pub fn validate_all(&self) -> ValidationSummary {
        let snapshots = self.inner.store.session_snapshots();
        let now = Utc::now();
        let stale_after = chrono_duration(self.inner.config.stale_warning_after);

        let mut results = Vec::with_capacity(snapshots.len());
        let mut warnings = Vec::new();
        let mut active_connections = 0;
        let mut orphaned_connections = 0;
        let mut properly_closed_sessions = 0;

        for snapshot in &snapshots {
            let validation = self.validate_session(snapshot);

            if validation.is_socket_open {
                active_connections += 1;
            }

            // Open socket with no terminal instance: the leak signature.
            if validation.is_socket_open && !validation.has_terminal_instance {
                orphaned_connections += 1;
                warnings.push(format!(
                    "session {} has an open socket but no terminal instance",
                    validation.session_id
                ));
            }

            if !validation.is_socket_open
                && validation.has_terminal_instance
                && validation.connection_status == SessionConnectionStatus::Disconnected
            {
                let inactive = now - validation.last_active_at;
                if inactive > stale_after {
                    warnings.push(format!(
                        "session {} holds a terminal instance but has been disconnected for {}s",
                        validation.session_id,
                        inactive.num_seconds()
                    ));
                }
            }

            if !validation.is_socket_open
                && !validation.has_terminal_instance
                && !validation.has_surface
                && validation.connection_status == SessionConnectionStatus::Disconnected
            {
                properly_closed_sessions += 1;
            }

            results.push(validation);
        }

        let summary = ValidationSummary {
            total_sessions: snapshots.len(),
            active_connections,
            orphaned_connections,
            properly_closed_sessions,
            sessions: results,
            warnings,
            validated_at: now,
        };

        let mut history = lock(&self.inner.history);
        history.push_back(summary.clone());
        while history.len() > self.inner.config.history_limit {
            history.pop_front();
        }

        summary
    }

    /// Start the monitoring loop. Re-arming replaces any prior timer.
    pub fn start_monitoring(
        &self,
        interval: Duration,
        callback: Option<Box<dyn Fn(&ValidationSummary) + Send + Sync>>,
    ) {
        info!(interval_ms = interval.as_millis() as u64, "starting connection monitoring");

        let weak: Weak<ValidatorInner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate first tick

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let validator = ConnectionValidator { inner };
                let summary = validator.validate_all();

                info!(
                    total = summary.total_sessions,
                    active = summary.active_connections,
                    orphaned = summary.orphaned_connections,
                    properly_closed = summary.properly_closed_sessions,
                    "connection status"
                );
                for warning in &summary.warnings {
                    warn!("{warning}");
                }

                if let Some(callback) = &callback {
                    callback(&summary);
                }
            }
        });

        let mut monitor = lock(&self.inner.monitor);
        if let Some(old) = monitor.replace(task) {
            old.abort();
        }
    }

    pub fn stop_monitoring(&self) {
        let mut monitor = lock(&self.inner.monitor);
        if let Some(task) = monitor.take() {
            task.abort();
            info!("stopped connection monitoring");
        }
    }

    pub fn history(&self) -> Vec<ValidationSummary> {
        lock(&self.inner.history).iter().cloned().collect()
    }

    /// Stricter pass: declared-disconnected sessions whose socket is still
    /// open indicate a bug, and resources unreleased long after disconnect
    /// count as leaks.
    pub fn check_for_leaks(&self) -> LeakReport {
        let summary = self.validate_all();
        let now = Utc::now();
        let leak_after = chrono_duration(self.inner.config.leak_after);

        let mut report = LeakReport::default();

        if summary.orphaned_connections > 0 {
            report.has_leaks = true;
            report.details.push(format!(
                "found {} orphaned socket connections",
                summary.orphaned_connections
            ));
        }

        for session in &summary.sessions {
            if session.connection_status != SessionConnectionStatus::Disconnected {
                continue;
            }
            if session.is_socket_open {
                report.has_leaks = true;
                report.details.push(format!(
                    "session {} is marked disconnected but its socket is still open",
                    session.session_id
                ));
            }
            if session.has_terminal_instance {
                let inactive = now - session.last_active_at;
                if inactive > leak_after {
                    report.has_leaks = true;
                    report.details.push(format!(
                        "session {} inactive for {} minutes but resources not released",
                        session.session_id,
                        inactive.num_minutes()
                    ));
                }
            }
        }

        report
    }

    /// Self-healing pass: drop dangling connections for orphaned sessions
    /// immediately, and force-close sessions inactive beyond the
    /// force-close window. Returns the number of sessions remediated.
    pub fn cleanup_orphaned_connections(&self) -> usize {
        let snapshots = self.inner.store.session_snapshots();
        let now = Utc::now();
        let force_close_after = chrono_duration(self.inner.config.force_close_after);
        let mut cleaned = 0;

        for snapshot in &snapshots {
            let validation = self.validate_session(snapshot);

            if validation.is_socket_open && !validation.has_terminal_instance {
                warn!(session = %snapshot.id, "cleaning up orphaned connection");
                self.inner
                    .store
                    .manager()
                    .close_isolated(IsolatedKind::Terminals, &snapshot.id);
                cleaned += 1;
                continue;
            }

            if validation.connection_status == SessionConnectionStatus::Disconnected
                && now - validation.last_active_at > force_close_after
            {
                warn!(session = %snapshot.id, "removing long-inactive session");
                self.inner.store.close_session(&snapshot.id);
                cleaned += 1;
            }
        }

        cleaned
    }
}

impl Drop for ValidatorInner {
    fn drop(&mut self) {
        if let Some(task) = self.monitor.get_mut().ok().and_then(Option::take) {
            task.abort();
        }
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis() as i64)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().expect("validator lock poisoned")
}
