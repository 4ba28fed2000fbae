// ABOUTME: Integration tests for reconnection policy: unbounded shared
// retries, bounded isolated retries, and queue survival across attempts

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use conlink::config::StrategyTable;
use conlink::transport::{MemoryConnector, ServerEnd};
use conlink::{
    ChannelEvent, Config, ConnectionId, ConnectionManager, ConnectionState, Frame, FrameKind,
    IsolatedConfig, IsolatedKind, ReconnectStrategy, Router, SharedChannel, StaticAuthGate,
};

fn fast_strategy(max_attempts: Option<u32>) -> ReconnectStrategy {
    ReconnectStrategy {
        max_attempts,
        initial_delay_ms: 10,
        max_delay_ms: 40,
        backoff_multiplier: 1.5,
        jitter: false,
        connect_timeout_ms: 1_000,
    }
}

fn test_config() -> Config {
    Config {
        strategies: StrategyTable {
            shared: fast_strategy(None),
            terminal: fast_strategy(Some(2)),
            default: fast_strategy(Some(5)),
        },
        health_check_interval_ms: 60_000,
        stale_after_ms: 60_000,
        ..Config::default()
    }
}

fn manager_with_memory_transport() -> (
    ConnectionManager,
    MemoryConnector,
    mpsc::UnboundedReceiver<ServerEnd>,
) {
    let (connector, accepted) = MemoryConnector::new();
    let handle = connector.handle();
    let manager = ConnectionManager::new(
        Arc::new(connector),
        Arc::new(StaticAuthGate::authenticated("test-token")),
        test_config(),
    );
    (manager, handle, accepted)
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
async fn test_shared_channel_reconnects_after_unexpected_close() {
    let (manager, _connector, mut accepted) = manager_with_memory_transport();
    let metrics = ConnectionId::shared(SharedChannel::Metrics);

    let _sub = manager.subscribe_to_shared(SharedChannel::Metrics, Router::new(|_| {}));
    let server = accept_connection(&mut accepted).await;
    manager.wait_until_open(&metrics, Duration::from_secs(2)).await.unwrap();

    server.hang_up();

    // The channel comes back on its own.
    let _server = accept_connection(&mut accepted).await;
    manager.wait_until_open(&metrics, Duration::from_secs(2)).await.unwrap();

    // A successful open resets the retry counter.
    let snapshot = manager.connection_snapshot(&metrics).unwrap();
    assert_eq!(snapshot.reconnect_attempts, 0);
}

#[tokio::test]
async fn test_isolated_retries_are_bounded_then_terminal() {
    let (manager, connector, _accepted) = manager_with_memory_transport();

    let events: Arc<Mutex<Vec<ChannelEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let id = ConnectionId::isolated(IsolatedKind::Terminals, "session-1");
    let sink = Arc::clone(&events);
    let _handle = manager.register_router(
        &id,
        Router::new(move |event| sink.lock().unwrap().push(event.clone())),
    );

    // Every dial fails; terminal strategy allows 2 retries after the
    // initial attempt.
    connector.fail_next(100);
    manager.create_isolated(IsolatedKind::Terminals, "session-1", None);

    wait_until("connection permanently closed", || {
        manager
            .connection_snapshot(&id)
            .is_some_and(|s| s.state == ConnectionState::Closed)
    })
    .await;

    // Initial attempt + 2 retries, then nothing more.
    assert_eq!(connector.attempts(), 3);
    sleep(Duration::from_millis(150)).await;
    assert_eq!(connector.attempts(), 3);
    assert_eq!(manager.pending_reconnects(), 0);

    let seen = events.lock().unwrap();
    assert!(
        seen.iter().any(|e| matches!(e, ChannelEvent::Frame(f) if f.is_error())),
        "exhausting the retry budget should route an error frame"
    );
}

#[tokio::test]
async fn test_queued_messages_survive_reconnect_attempts() {
    let (manager, connector, mut accepted) = manager_with_memory_transport();

    connector.fail_next(2);
    let id = manager.create_isolated(IsolatedKind::Executions, "job-1", None);

    manager.send(&id, Frame::input("alpha")).unwrap();
    manager.send(&id, Frame::input("beta")).unwrap();

    // Third dial succeeds and the queue flushes in order, no duplicates.
    let mut server = accept_connection(&mut accepted).await;
    let mut inputs = Vec::new();
    while inputs.len() < 2 {
        let frame = timeout(Duration::from_secs(2), server.recv_frame())
            .await
            .expect("timed out waiting for flushed frames")
            .expect("socket closed early");
        if frame.kind() == FrameKind::Input {
            inputs.push(frame);
        }
    }
    assert_eq!(inputs, vec![Frame::input("alpha"), Frame::input("beta")]);
    assert_eq!(manager.queued_messages(&id), 0);

    sleep(Duration::from_millis(30)).await;
    assert!(server.drain_frames().iter().all(|f| f.kind() != FrameKind::Input));
}

#[tokio::test]
async fn test_queue_drops_oldest_beyond_bound() {
    let (connector, _accepted) = MemoryConnector::new();
    connector.fail_next(1_000);
    let manager = ConnectionManager::new(
        Arc::new(connector),
        Arc::new(StaticAuthGate::authenticated("test-token")),
        Config {
            max_queue_len: 3,
            ..test_config()
        },
    );

    let id = manager.create_isolated(IsolatedKind::Executions, "job-2", None);
    for i in 0..5 {
        manager.send(&id, Frame::input(format!("msg-{i}"))).unwrap();
    }

    assert_eq!(manager.queued_messages(&id), 3);
}

#[tokio::test]
async fn test_send_to_permanently_closed_connection_stays_queued_without_retry() {
    let (manager, connector, _accepted) = manager_with_memory_transport();
    let id = ConnectionId::isolated(IsolatedKind::Terminals, "session-2");

    connector.fail_next(100);
    manager.create_isolated(IsolatedKind::Terminals, "session-2", None);
    wait_until("retry budget exhausted", || {
        manager
            .connection_snapshot(&id)
            .is_some_and(|s| s.state == ConnectionState::Closed)
    })
    .await;
    let dialed = connector.attempts();

    // A send against a permanently closed connection cannot revive it; the
    // budget is spent.
    manager.send(&id, Frame::input("too late")).unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.attempts(), dialed);
    assert_eq!(manager.pending_reconnects(), 0);
}

#[tokio::test]
async fn test_manual_reconnect_revives_a_permanently_closed_connection() {
    let (manager, connector, mut accepted) = manager_with_memory_transport();
    let id = ConnectionId::isolated(IsolatedKind::Terminals, "session-3");

    connector.fail_next(100);
    manager.create_isolated(IsolatedKind::Terminals, "session-3", None);
    wait_until("retry budget exhausted", || {
        manager
            .connection_snapshot(&id)
            .is_some_and(|s| s.state == ConnectionState::Closed)
    })
    .await;

    // The operator's explicit action gets a fresh dial even after
    // exhaustion.
    connector.fail_next(0);
    manager.reconnect(&id).unwrap();
    let _server = accept_connection(&mut accepted).await;
    manager.wait_until_open(&id, Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_reconnect_uses_per_connection_strategy_override() {
    let (manager, connector, _accepted) = manager_with_memory_transport();

    connector.fail_next(100);
    let override_config = IsolatedConfig {
        strategy: Some(fast_strategy(Some(0))),
        ..IsolatedConfig::default()
    };
    let id = manager.create_isolated(IsolatedKind::ContainerLogs, "ct-9", Some(override_config));

    wait_until("zero-retry strategy closes immediately", || {
        manager
            .connection_snapshot(&id)
            .is_some_and(|s| s.state == ConnectionState::Closed)
    })
    .await;
    assert_eq!(connector.attempts(), 1);
}
