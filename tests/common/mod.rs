#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use user_store::config::{BackendKind, Config, RetryConfig};
use user_store::db::MemoryStore;
use user_store::types::{ConnectionEvent, ConnectionEventKind};
use user_store::{StoreError, UserStore};

pub const RETRY_DELAY: Duration = Duration::from_millis(50);

pub fn test_config() -> Config {
    Config {
        backend: BackendKind::Memory,
        retry: RetryConfig::fixed(RETRY_DELAY),
        ..Config::default()
    }
}

pub async fn memory_store(cfg: &Config) -> (MemoryStore, UserStore) {
    let backend = MemoryStore::new();
    let store = UserStore::new(Arc::new(backend.clone()), cfg)
        .await
        .expect("failed to build user store");
    (backend, store)
}

pub async fn ready_store() -> (MemoryStore, UserStore) {
    let (backend, store) = memory_store(&test_config()).await;
    store.set_up().await.expect("set_up failed");
    (backend, store)
}

/// Retry `op` while it fails with a connection error, for at most two seconds.
pub async fn eventually<T, F, Fut>(mut op: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        match op().await {
            Ok(value) => return value,
            Err(e) if e.is_connection() && tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => panic!("operation did not recover: {e}"),
        }
    }
}

/// Collect event kinds until `stop` matches one, or fail after two seconds.
pub async fn events_until(
    rx: &mut broadcast::Receiver<ConnectionEvent>,
    stop: impl Fn(&ConnectionEventKind) -> bool,
) -> Vec<ConnectionEventKind> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            let done = stop(&event.kind);
            seen.push(event.kind);
            if done {
                break;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for event; saw {seen:?}"));
    seen
}
