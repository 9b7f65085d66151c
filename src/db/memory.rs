//! In-process document store with the same semantics as the real backend, plus
//! hooks to break it on purpose.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;
use tracing::debug;

use crate::config::StoreCoordinates;
use crate::db::driver::{
    Connection, ConnectionSignal, Connector, Cursor, DriverError, InsertSummary,
};
use crate::db::schema::{SchemaObject, SchemaSpec};

/// Most recent operations kept by [`MemoryStore::ops`].
pub const OP_LOG_LIMIT: usize = 256;

struct MemoryIndex {
    /// False when the build failed; the entry lingers until a wait drops it.
    valid: bool,
    ready_at: Option<Instant>,
}

#[derive(Default)]
struct MemoryTable {
    docs: Vec<Value>,
    indexes: HashMap<String, MemoryIndex>,
}

#[derive(Default)]
struct MemoryState {
    databases: HashMap<String, HashMap<String, MemoryTable>>,
    live: Vec<Weak<MemoryConnection>>,
    ops: VecDeque<String>,
    refuse_connections: bool,
    connect_delay: Duration,
    index_build_time: Duration,
}

impl MemoryState {
    fn record(&mut self, op: &str) {
        if self.ops.len() == OP_LOG_LIMIT {
            self.ops.pop_front();
        }
        self.ops.push_back(op.to_string());
    }
}

/// Shared in-memory store. Clones point at the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes created from now on become queryable only after `build_time`.
    pub async fn set_index_build_time(&self, build_time: Duration) {
        self.state.lock().await.index_build_time = build_time;
    }

    /// Make subsequent connect attempts fail (or succeed again).
    pub async fn refuse_connections(&self, refuse: bool) {
        self.state.lock().await.refuse_connections = refuse;
    }

    /// Hold every subsequent connect attempt for `delay` before it resolves.
    pub async fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().await.connect_delay = delay;
    }

    /// Close every live connection, notifying their observers.
    pub async fn sever_connections(&self) -> usize {
        let live: Vec<_> = {
            let mut state = self.state.lock().await;
            state.live.drain(..).filter_map(|w| w.upgrade()).collect()
        };
        for conn in &live {
            conn.sever();
        }
        live.len()
    }

    /// Push a non-fatal error notification to every live connection.
    pub async fn report_error(&self, message: &str) {
        let state = self.state.lock().await;
        for conn in state.live.iter().filter_map(Weak::upgrade) {
            let _ = conn.signals.send(ConnectionSignal::Error(message.to_string()));
        }
    }

    /// Insert a document directly, bypassing unique indexes, as an out-of-band
    /// writer would.
    pub async fn insert_raw(&self, spec: &SchemaSpec, doc: Value) -> Result<(), DriverError> {
        let mut state = self.state.lock().await;
        let table = table_mut(&mut state, spec)?;
        table.docs.push(doc);
        Ok(())
    }

    /// Names of the last [`OP_LOG_LIMIT`] operations issued, oldest first.
    pub async fn ops(&self) -> Vec<String> {
        self.state.lock().await.ops.iter().cloned().collect()
    }

    pub async fn clear_ops(&self) {
        self.state.lock().await.ops.clear();
    }

    pub async fn live_connections(&self) -> usize {
        let state = self.state.lock().await;
        state.live.iter().filter(|w| w.strong_count() > 0).count()
    }
}

#[async_trait]
impl Connector for MemoryStore {
    async fn connect(
        &self,
        coordinates: &StoreCoordinates,
    ) -> Result<Arc<dyn Connection>, DriverError> {
        tokio::task::yield_now().await;
        let delay = self.state.lock().await.connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().await;
        state.record("connect");
        if state.refuse_connections {
            return Err(DriverError::Disconnected(format!(
                "connection refused by {}:{}",
                coordinates.host, coordinates.port
            )));
        }
        let (signals, _) = broadcast::channel(16);
        let conn = Arc::new(MemoryConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            store: self.clone(),
            closed: AtomicBool::new(false),
            signals,
        });
        state.live.retain(|w| w.strong_count() > 0);
        state.live.push(Arc::downgrade(&conn));
        debug!(id = conn.id, "memory connection opened");
        Ok(conn)
    }
}

pub struct MemoryConnection {
    id: u64,
    store: MemoryStore,
    closed: AtomicBool,
    signals: broadcast::Sender<ConnectionSignal>,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryConnection {
    fn sever(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.signals.send(ConnectionSignal::Closed);
        }
    }

    /// Suspend like a network round-trip would, then lock the store.
    async fn begin(&self, op: &str) -> Result<tokio::sync::MutexGuard<'_, MemoryState>, DriverError> {
        tokio::task::yield_now().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Disconnected(format!(
                "connection {} is closed",
                self.id
            )));
        }
        let mut state = self.store.state.lock().await;
        state.record(op);
        Ok(state)
    }
}

fn table_mut<'a>(
    state: &'a mut MemoryState,
    spec: &SchemaSpec,
) -> Result<&'a mut MemoryTable, DriverError> {
    state
        .databases
        .get_mut(spec.db())
        .ok_or_else(|| DriverError::NoSuchObject {
            object: SchemaObject::Database,
            name: spec.db().to_string(),
        })?
        .get_mut(spec.table())
        .ok_or_else(|| DriverError::NoSuchObject {
            object: SchemaObject::Table,
            name: spec.table().to_string(),
        })
}

fn matches_key(doc: &Value, field: &str, value: &str) -> bool {
    doc.get(field).and_then(Value::as_str) == Some(value)
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn db_create(&self, spec: &SchemaSpec) -> Result<(), DriverError> {
        let mut state = self.begin("db_create").await?;
        if state.databases.contains_key(spec.db()) {
            return Err(DriverError::AlreadyExists {
                object: SchemaObject::Database,
                name: spec.db().to_string(),
            });
        }
        state.databases.insert(spec.db().to_string(), HashMap::new());
        Ok(())
    }

    async fn table_create(&self, spec: &SchemaSpec) -> Result<(), DriverError> {
        let mut state = self.begin("table_create").await?;
        let db = state
            .databases
            .get_mut(spec.db())
            .ok_or_else(|| DriverError::NoSuchObject {
                object: SchemaObject::Database,
                name: spec.db().to_string(),
            })?;
        if db.contains_key(spec.table()) {
            return Err(DriverError::AlreadyExists {
                object: SchemaObject::Table,
                name: spec.table().to_string(),
            });
        }
        db.insert(spec.table().to_string(), MemoryTable::default());
        Ok(())
    }

    async fn index_create(&self, spec: &SchemaSpec) -> Result<(), DriverError> {
        let mut state = self.begin("index_create").await?;
        let ready_at = Instant::now() + state.index_build_time;
        let table = table_mut(&mut state, spec)?;
        if table.indexes.contains_key(spec.index()) {
            return Err(DriverError::AlreadyExists {
                object: SchemaObject::Index,
                name: spec.index().to_string(),
            });
        }
        let mut seen = HashSet::new();
        let clash = table
            .docs
            .iter()
            .filter_map(|d| d.get(spec.index()).and_then(Value::as_str))
            .any(|key| !seen.insert(key));
        // A failed build leaves an invalid index behind, as PostgreSQL does.
        table.indexes.insert(
            spec.index().to_string(),
            MemoryIndex {
                valid: !clash,
                ready_at: Some(ready_at),
            },
        );
        if clash {
            return Err(DriverError::UniqueViolation(spec.index_name()));
        }
        Ok(())
    }

    async fn index_wait(&self, spec: &SchemaSpec) -> Result<(), DriverError> {
        let missing = || DriverError::NoSuchObject {
            object: SchemaObject::Index,
            name: spec.index().to_string(),
        };
        let ready_at = {
            let mut state = self.begin("index_wait").await?;
            let table = table_mut(&mut state, spec)?;
            let index = table.indexes.get(spec.index()).ok_or_else(missing)?;
            if !index.valid {
                debug!(index = %spec.index_name(), "dropping invalid index");
                table.indexes.remove(spec.index());
                return Err(missing());
            }
            index.ready_at
        };
        if let Some(at) = ready_at {
            tokio::time::sleep_until(at).await;
        }
        Ok(())
    }

    async fn is_empty(&self, spec: &SchemaSpec, value: &str) -> Result<bool, DriverError> {
        let mut state = self.begin("is_empty").await?;
        let table = table_mut(&mut state, spec)?;
        Ok(!table
            .docs
            .iter()
            .any(|d| matches_key(d, spec.index(), value)))
    }

    async fn get_all(&self, spec: &SchemaSpec, value: &str) -> Result<Cursor, DriverError> {
        let mut state = self.begin("get_all").await?;
        let table = table_mut(&mut state, spec)?;
        let rows = table
            .docs
            .iter()
            .filter(|d| matches_key(d, spec.index(), value))
            .cloned()
            .collect();
        Ok(Cursor::from_rows(rows))
    }

    async fn insert(&self, spec: &SchemaSpec, doc: Value) -> Result<InsertSummary, DriverError> {
        let mut state = self.begin("insert").await?;
        let table = table_mut(&mut state, spec)?;
        if table.indexes.contains_key(spec.index())
            && let Some(key) = doc.get(spec.index()).and_then(Value::as_str)
            && table.docs.iter().any(|d| matches_key(d, spec.index(), key))
        {
            return Err(DriverError::UniqueViolation(spec.index_name()));
        }
        table.docs.push(doc);
        Ok(InsertSummary { inserted: 1 })
    }

    async fn close(&self) {
        self.sever();
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionSignal> {
        self.signals.subscribe()
    }
}
