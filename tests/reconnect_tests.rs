mod common;

use std::time::Duration;

use user_store::config::{Config, RetryConfig};
use user_store::types::{ConnectionEventKind, ConnectionState};
use user_store::{StoreError, User};

use common::{RETRY_DELAY, eventually, events_until, memory_store, ready_store, test_config};

const PROMPTLY: Duration = Duration::from_millis(500);

#[tokio::test]
async fn operations_recover_after_the_connection_closes() {
    let (backend, store) = ready_store().await;
    store
        .put(&User::new("alice", "h1", "a@x.com"))
        .await
        .expect("put alice");

    assert_eq!(backend.sever_connections().await, 1);

    let found = eventually(|| store.get("alice")).await;
    assert_eq!(found.username, "alice");

    let bob = User::new("bob", "h2", "b@x.com");
    eventually(|| store.put(&bob)).await;
    assert_eq!(store.get("bob").await.expect("get bob"), bob);
}

#[tokio::test]
async fn close_event_drives_the_reconnect_cycle() {
    let (backend, store) = ready_store().await;
    let mut events = store.subscribe();

    backend.sever_connections().await;

    let seen = events_until(&mut events, |k| *k == ConnectionEventKind::Connected).await;
    assert_eq!(
        seen,
        vec![
            ConnectionEventKind::Closed,
            ConnectionEventKind::ReconnectScheduled {
                attempt: 1,
                delay: RETRY_DELAY
            },
            ConnectionEventKind::Connecting { attempt: 1 },
            ConnectionEventKind::Connected,
        ]
    );
    assert_eq!(
        store.connection_state().await.expect("state"),
        ConnectionState::Connected
    );
    assert_eq!(backend.live_connections().await, 1);
}

#[tokio::test]
async fn operations_fail_fast_while_disconnected() {
    let (backend, store) = ready_store().await;
    let mut events = store.subscribe();

    backend.refuse_connections(true).await;
    backend.sever_connections().await;
    events_until(&mut events, |k| {
        matches!(k, ConnectionEventKind::ReconnectScheduled { attempt: 2, .. })
    })
    .await;

    let started = tokio::time::Instant::now();
    let err = store.get("alice").await.unwrap_err();
    assert!(err.is_connection(), "unexpected error: {err}");
    assert!(started.elapsed() < RETRY_DELAY);
    assert!(matches!(
        store.connection_state().await.expect("state"),
        ConnectionState::Reconnecting { .. }
    ));

    backend.refuse_connections(false).await;
    let carol = User::new("carol", "h3", "c@x.com");
    eventually(|| store.put(&carol)).await;
}

#[tokio::test]
async fn operations_fail_fast_while_a_reconnect_attempt_hangs() {
    let (backend, store) = ready_store().await;
    store
        .put(&User::new("alice", "h1", "a@x.com"))
        .await
        .expect("put alice");
    let mut events = store.subscribe();

    backend.set_connect_delay(Duration::from_secs(10)).await;
    backend.sever_connections().await;
    events_until(&mut events, |k| {
        matches!(k, ConnectionEventKind::Connecting { .. })
    })
    .await;

    let get = tokio::time::timeout(PROMPTLY, store.get("alice"))
        .await
        .expect("get waited on the connect attempt");
    assert!(matches!(get, Err(ref e) if e.is_connection()), "unexpected: {get:?}");

    let put = tokio::time::timeout(PROMPTLY, store.put(&User::new("bob", "h2", "b@x.com")))
        .await
        .expect("put waited on the connect attempt");
    assert!(matches!(put, Err(ref e) if e.is_connection()), "unexpected: {put:?}");

    let state = tokio::time::timeout(PROMPTLY, store.connection_state())
        .await
        .expect("state query waited on the connect attempt")
        .expect("state");
    assert_eq!(state, ConnectionState::Connecting);

    store.close().await;
}

#[tokio::test]
async fn concurrent_set_up_calls_share_one_connect_attempt() {
    let (backend, store) = memory_store(&test_config()).await;
    backend.set_connect_delay(Duration::from_millis(50)).await;

    let (a, b) = tokio::join!(store.set_up(), store.set_up());
    a.expect("first set_up");
    b.expect("second set_up");

    let connects = backend
        .ops()
        .await
        .iter()
        .filter(|op| op.as_str() == "connect")
        .count();
    assert_eq!(connects, 1);
    assert_eq!(backend.live_connections().await, 1);
}

#[tokio::test]
async fn bounded_retries_give_up_and_set_up_can_reconnect() {
    let cfg = Config {
        retry: RetryConfig {
            delay_ms: 20,
            max_attempts: Some(2),
            factor: 1.0,
            max_delay_ms: 20,
        },
        ..test_config()
    };
    let (backend, store) = memory_store(&cfg).await;
    store.set_up().await.expect("set_up");
    let mut events = store.subscribe();

    backend.refuse_connections(true).await;
    backend.sever_connections().await;

    let seen = events_until(&mut events, |k| {
        matches!(k, ConnectionEventKind::GaveUp { .. })
    })
    .await;
    assert_eq!(seen.last(), Some(&ConnectionEventKind::GaveUp { attempts: 2 }));
    let scheduled = seen
        .iter()
        .filter(|k| matches!(k, ConnectionEventKind::ReconnectScheduled { .. }))
        .count();
    assert_eq!(scheduled, 2);
    assert_eq!(
        store.connection_state().await.expect("state"),
        ConnectionState::Disconnected
    );

    // Nothing else is attempted once the budget is spent.
    backend.clear_ops().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(backend.ops().await.is_empty());

    backend.refuse_connections(false).await;
    store.set_up().await.expect("set_up reconnects");
    assert_eq!(
        store.connection_state().await.expect("state"),
        ConnectionState::Connected
    );
}

#[tokio::test]
async fn growing_backoff_lengthens_the_delay() {
    let cfg = Config {
        retry: RetryConfig {
            delay_ms: 10,
            max_attempts: None,
            factor: 2.0,
            max_delay_ms: 1000,
        },
        ..test_config()
    };
    let (backend, store) = memory_store(&cfg).await;
    store.set_up().await.expect("set_up");
    let mut events = store.subscribe();

    backend.refuse_connections(true).await;
    backend.sever_connections().await;

    let seen = events_until(&mut events, |k| {
        matches!(k, ConnectionEventKind::ReconnectScheduled { attempt: 3, .. })
    })
    .await;
    let delays: Vec<_> = seen
        .iter()
        .filter_map(|k| match k {
            ConnectionEventKind::ReconnectScheduled { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(40)
        ]
    );

    store.close().await;
}

#[tokio::test]
async fn store_errors_are_reported_without_dropping_the_connection() {
    let (backend, store) = ready_store().await;
    let mut events = store.subscribe();

    backend.report_error("disk quota exceeded").await;

    let seen = events_until(&mut events, |k| matches!(k, ConnectionEventKind::Error(_))).await;
    assert_eq!(
        seen,
        vec![ConnectionEventKind::Error("disk quota exceeded".to_string())]
    );
    assert_eq!(
        store.connection_state().await.expect("state"),
        ConnectionState::Connected
    );
    assert!(matches!(store.get("nobody").await, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn close_releases_the_connection_and_stops_reconnecting() {
    let (backend, store) = ready_store().await;
    assert_eq!(backend.live_connections().await, 1);

    store.close().await;

    assert_eq!(backend.live_connections().await, 0);
    assert!(matches!(store.get("alice").await, Err(StoreError::NotReady)));

    backend.clear_ops().await;
    tokio::time::sleep(RETRY_DELAY * 3).await;
    assert!(backend.ops().await.is_empty());
}
