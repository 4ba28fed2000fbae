// ABOUTME: Integration tests for leak detection: orphaned connections,
// status/socket divergence, staleness windows, and self-healing cleanup

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use conlink::config::StrategyTable;
use conlink::session::ScriptedSurface;
use conlink::transport::{MemoryConnector, ServerEnd};
use conlink::validate::ValidatorConfig;
use conlink::{
    Config, ConnectionManager, ConnectionValidator, IsolatedKind, ReconnectStrategy, SessionStore,
    StaticAuthGate, TerminalSurface,
};

fn test_config() -> Config {
    Config {
        strategies: StrategyTable {
            shared: ReconnectStrategy::shared(),
            terminal: ReconnectStrategy {
                max_attempts: Some(2),
                initial_delay_ms: 10,
                max_delay_ms: 40,
                backoff_multiplier: 1.5,
                jitter: false,
                connect_timeout_ms: 1_000,
            },
            default: ReconnectStrategy::default_policy(),
        },
        health_check_interval_ms: 60_000,
        stale_after_ms: 60_000,
        ..Config::default()
    }
}

fn store_with_memory_transport() -> (SessionStore, mpsc::UnboundedReceiver<ServerEnd>) {
    let (connector, accepted) = MemoryConnector::new();
    let manager = ConnectionManager::new(
        Arc::new(connector),
        Arc::new(StaticAuthGate::authenticated("test-token")),
        test_config(),
    );
    (SessionStore::new(manager), accepted)
}

async fn accept_connection(accepted: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    timeout(Duration::from_secs(2), accepted.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn test_orphan_detection_counts_exactly_the_orphans() {
    let (store, mut accepted) = store_with_memory_transport();
    let validator = ConnectionValidator::new(store.clone());

    // Connected without ever attaching a terminal: socket open, no
    // emulator. That is the orphan signature.
    let orphan = store.create_session(None);
    let accept_task =
        tokio::spawn(async move { (accept_connection(&mut accepted).await, accepted) });
    store.connect_session(&orphan).await.unwrap();
    let (_server, mut accepted) = accept_task.await.unwrap();

    // A healthy session for contrast.
    let healthy = store.create_session(None);
    let surface: Arc<dyn TerminalSurface> = ScriptedSurface::new(80, 24);
    let accept_task =
        tokio::spawn(async move { (accept_connection(&mut accepted).await, accepted) });
    store.initialize_terminal(&healthy, &surface).await.unwrap();
    let (_server2, _accepted) = accept_task.await.unwrap();

    let summary = validator.validate_all();
    assert_eq!(summary.total_sessions, 2);
    assert_eq!(summary.active_connections, 2);
    assert_eq!(summary.orphaned_connections, 1);
    assert!(summary.warnings.iter().any(|w| w.contains(&orphan)));
}

#[tokio::test]
async fn test_cleanup_remediates_orphans_immediately() {
    let (store, mut accepted) = store_with_memory_transport();
    let validator = ConnectionValidator::new(store.clone());

    let orphan = store.create_session(None);
    let accept_task =
        tokio::spawn(async move { (accept_connection(&mut accepted).await, accepted) });
    store.connect_session(&orphan).await.unwrap();
    let (_server, _accepted) = accept_task.await.unwrap();

    assert_eq!(validator.validate_all().orphaned_connections, 1);

    // No waiting for any inactivity threshold: detected orphans are
    // remediated on the spot.
    let cleaned = validator.cleanup_orphaned_connections();
    assert_eq!(cleaned, 1);

    wait_until("orphaned socket closed", || {
        store.manager().total_connections() == 0
    })
    .await;
    assert_eq!(validator.validate_all().orphaned_connections, 0);
}

#[tokio::test]
async fn test_properly_closed_sessions_are_counted_separately() {
    let (store, _accepted) = store_with_memory_transport();
    let validator = ConnectionValidator::new(store.clone());

    let a = store.create_session(None);
    let b = store.create_session(None);
    store.disconnect_session(&a);
    store.disconnect_session(&b);

    let summary = validator.validate_all();
    assert_eq!(summary.total_sessions, 2);
    assert_eq!(summary.properly_closed_sessions, 2);
    assert_eq!(summary.orphaned_connections, 0);
    assert!(summary.warnings.is_empty());
}

#[tokio::test]
async fn test_leak_check_flags_disconnected_session_with_open_socket() {
    let (store, mut accepted) = store_with_memory_transport();
    let validator = ConnectionValidator::new(store.clone());

    let id = store.create_session(None);
    let surface: Arc<dyn TerminalSurface> = ScriptedSurface::new(80, 24);
    let accept_task =
        tokio::spawn(async move { (accept_connection(&mut accepted).await, accepted) });
    store.initialize_terminal(&id, &surface).await.unwrap();
    let (_server, mut accepted) = accept_task.await.unwrap();

    store.disconnect_session(&id);

    // Simulate the bug the validator exists for: a socket reappears under
    // the session's key while the session still says disconnected.
    store
        .manager()
        .create_isolated(IsolatedKind::Terminals, &id, None);
    let _rogue = accept_connection(&mut accepted).await;
    wait_until("rogue socket open", || {
        store.manager().active_connections() == 1
    })
    .await;

    let report = validator.check_for_leaks();
    assert!(report.has_leaks);
    assert!(
        report
            .details
            .iter()
            .any(|d| d.contains(&id) && d.contains("still open")),
        "details should name the inconsistent session: {:?}",
        report.details
    );
}

#[tokio::test]
async fn test_stale_disconnected_session_draws_a_warning() {
    let (store, mut accepted) = store_with_memory_transport();
    let validator = ConnectionValidator::with_config(
        store.clone(),
        ValidatorConfig {
            stale_warning_after: Duration::from_millis(50),
            ..ValidatorConfig::default()
        },
    );

    let id = store.create_session(None);
    let surface: Arc<dyn TerminalSurface> = ScriptedSurface::new(80, 24);
    let accept_task =
        tokio::spawn(async move { (accept_connection(&mut accepted).await, accepted) });
    store.initialize_terminal(&id, &surface).await.unwrap();
    let (_server, _accepted) = accept_task.await.unwrap();
    store.disconnect_session(&id);

    assert!(validator.validate_all().warnings.is_empty());

    sleep(Duration::from_millis(80)).await;
    let summary = validator.validate_all();
    assert!(
        summary.warnings.iter().any(|w| w.contains(&id)),
        "expected a staleness warning: {:?}",
        summary.warnings
    );
}

#[tokio::test]
async fn test_long_inactive_sessions_are_force_closed() {
    let (store, _accepted) = store_with_memory_transport();
    let validator = ConnectionValidator::with_config(
        store.clone(),
        ValidatorConfig {
            force_close_after: Duration::from_millis(50),
            ..ValidatorConfig::default()
        },
    );

    let id = store.create_session(None);
    store.disconnect_session(&id);
    sleep(Duration::from_millis(80)).await;

    let cleaned = validator.cleanup_orphaned_connections();
    assert_eq!(cleaned, 1);
    assert_eq!(store.session_count(), 0);
}

#[tokio::test]
async fn test_history_is_bounded() {
    let (store, _accepted) = store_with_memory_transport();
    let validator = ConnectionValidator::with_config(
        store,
        ValidatorConfig {
            history_limit: 5,
            ..ValidatorConfig::default()
        },
    );

    for _ in 0..8 {
        validator.validate_all();
    }
    assert_eq!(validator.history().len(), 5);
}

#[tokio::test]
async fn test_monitoring_rearms_and_stops() {
    let (store, _accepted) = store_with_memory_transport();
    let validator = ConnectionValidator::new(store);

    let ticks = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&ticks);
    validator.start_monitoring(
        Duration::from_millis(20),
        Some(Box::new(move |_summary| {
            count.fetch_add(1, Ordering::SeqCst);
        })),
    );

    wait_until("monitor ticked", || ticks.load(Ordering::SeqCst) >= 2).await;

    // Re-arming replaces the old timer rather than stacking another.
    let count = Arc::clone(&ticks);
    validator.start_monitoring(
        Duration::from_millis(20),
        Some(Box::new(move |_summary| {
            count.fetch_add(1, Ordering::SeqCst);
        })),
    );
    sleep(Duration::from_millis(90)).await;
    let after_rearm = ticks.load(Ordering::SeqCst);
    assert!(
        after_rearm <= 12,
        "stacked timers would tick roughly twice as fast: {after_rearm}"
    );

    validator.stop_monitoring();
    let stopped_at = ticks.load(Ordering::SeqCst);
    sleep(Duration::from_millis(80)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), stopped_at);
}
