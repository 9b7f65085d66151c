use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::types::Json;
use sqlx::{Connection as _, Error as SqlxError};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::config::{PostgresOptions, StoreCoordinates};
use crate::db::driver::{
    Connection, ConnectionSignal, Connector, Cursor, DriverError, InsertSummary,
};
use crate::db::schema::{SchemaObject, SchemaSpec, postgres as ddl};

const INDEX_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexStatus {
    Ready,
    Building,
    /// Left behind by a failed concurrent build; never becomes ready.
    Invalid,
    Missing,
}

impl IndexStatus {
    fn from_row(row: Option<(bool, bool)>) -> Self {
        match row {
            None => Self::Missing,
            Some((true, _)) => Self::Ready,
            Some((false, true)) => Self::Building,
            Some((false, false)) => Self::Invalid,
        }
    }
}

/// Opens single, unpooled PostgreSQL connections.
#[derive(Debug, Clone, Default)]
pub struct PostgresConnector {
    options: PostgresOptions,
}

impl PostgresConnector {
    pub fn new(options: PostgresOptions) -> Self {
        Self { options }
    }

    fn connect_options(&self, coordinates: &StoreCoordinates) -> PgConnectOptions {
        let opts = PgConnectOptions::new()
            .host(&coordinates.host)
            .port(coordinates.port)
            .username(&self.options.user)
            .database(&self.options.database)
            .application_name("user-store");
        match coordinates.auth_key.as_deref() {
            Some(key) if !key.is_empty() => opts.password(key),
            _ => opts,
        }
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    async fn connect(
        &self,
        coordinates: &StoreCoordinates,
    ) -> Result<Arc<dyn Connection>, DriverError> {
        let conn = PgConnection::connect_with(&self.connect_options(coordinates))
            .await
            .map_err(|e| DriverError::Disconnected(e.to_string()))?;
        let (signals, _) = broadcast::channel(16);
        let inner = Arc::new(PgInner {
            conn: Mutex::new(Some(conn)),
            closed: AtomicBool::new(false),
            signals,
        });
        tokio::spawn(keepalive(
            Arc::downgrade(&inner),
            self.options.keepalive_interval(),
        ));
        Ok(Arc::new(PostgresConnection { inner }))
    }
}

struct PgInner {
    conn: Mutex<Option<PgConnection>>,
    closed: AtomicBool,
    signals: broadcast::Sender<ConnectionSignal>,
}

impl PgInner {
    fn mark_closed(&self, reason: &str) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            warn!(reason, "postgres connection lost");
            let _ = self.signals.send(ConnectionSignal::Closed);
        }
    }

    /// Map a sqlx error onto the driver taxonomy, flagging the connection as
    /// closed when the failure is at the transport level.
    fn classify(&self, err: SqlxError, object: SchemaObject, name: &str) -> DriverError {
        let classified = classify(err, object, name);
        match &classified {
            DriverError::Disconnected(reason) => self.mark_closed(reason),
            DriverError::Query(msg) => {
                let _ = self.signals.send(ConnectionSignal::Error(msg.clone()));
            }
            _ => {}
        }
        classified
    }
}

fn classify(err: SqlxError, object: SchemaObject, name: &str) -> DriverError {
    match err {
        SqlxError::Database(db) => match db.code().as_deref() {
            // duplicate_schema, duplicate_table (also raised for relations such as indexes)
            Some("42P06") | Some("42P07") => DriverError::AlreadyExists {
                object,
                name: name.to_string(),
            },
            Some("23505") => DriverError::UniqueViolation(name.to_string()),
            // invalid_schema_name
            Some("3F000") => DriverError::NoSuchObject {
                object: SchemaObject::Database,
                name: name.to_string(),
            },
            // undefined_table
            Some("42P01") => DriverError::NoSuchObject {
                object: SchemaObject::Table,
                name: name.to_string(),
            },
            // admin_shutdown, crash_shutdown, cannot_connect_now
            Some("57P01") | Some("57P02") | Some("57P03") => {
                DriverError::Disconnected(db.message().to_string())
            }
            _ => DriverError::Query(db.message().to_string()),
        },
        SqlxError::Io(e) => DriverError::Disconnected(e.to_string()),
        SqlxError::Tls(e) => DriverError::Disconnected(e.to_string()),
        SqlxError::Protocol(msg) => DriverError::Disconnected(msg),
        SqlxError::PoolClosed | SqlxError::WorkerCrashed => {
            DriverError::Disconnected("connection worker stopped".to_string())
        }
        other => DriverError::Query(other.to_string()),
    }
}

async fn keepalive(inner: Weak<PgInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut guard = inner.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return;
        };
        if let Err(e) = conn.ping().await {
            drop(guard);
            inner.mark_closed(&e.to_string());
            return;
        }
    }
}

#[derive(Clone)]
pub struct PostgresConnection {
    inner: Arc<PgInner>,
}

impl std::fmt::Debug for PostgresConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConnection")
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

fn disconnected() -> DriverError {
    DriverError::Disconnected("connection is closed".to_string())
}

impl PostgresConnection {
    async fn execute_ddl(
        &self,
        sql: String,
        object: SchemaObject,
        name: &str,
    ) -> Result<(), DriverError> {
        let mut guard = self.inner.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(disconnected)?;
        debug!(sql = %sql.trim(), "executing ddl");
        sqlx::query(&sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| self.inner.classify(e, object, name))?;
        Ok(())
    }

    async fn index_status(&self, spec: &SchemaSpec) -> Result<IndexStatus, DriverError> {
        let mut guard = self.inner.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(disconnected)?;
        let row = sqlx::query_as::<_, (bool, bool)>(ddl::INDEX_STATUS)
            .bind(spec.db())
            .bind(spec.index_name())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| self.inner.classify(e, SchemaObject::Index, spec.index()))?;
        Ok(IndexStatus::from_row(row))
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn db_create(&self, spec: &SchemaSpec) -> Result<(), DriverError> {
        self.execute_ddl(ddl::create_database(spec), SchemaObject::Database, spec.db())
            .await
    }

    async fn table_create(&self, spec: &SchemaSpec) -> Result<(), DriverError> {
        self.execute_ddl(ddl::create_table(spec), SchemaObject::Table, spec.table())
            .await
    }

    async fn index_create(&self, spec: &SchemaSpec) -> Result<(), DriverError> {
        self.execute_ddl(ddl::create_index(spec), SchemaObject::Index, spec.index())
            .await
    }

    async fn index_wait(&self, spec: &SchemaSpec) -> Result<(), DriverError> {
        let missing = || DriverError::NoSuchObject {
            object: SchemaObject::Index,
            name: spec.index_name(),
        };
        loop {
            match self.index_status(spec).await? {
                IndexStatus::Ready => return Ok(()),
                IndexStatus::Building => {
                    debug!(index = %spec.index_name(), "index still building");
                    tokio::time::sleep(INDEX_POLL_INTERVAL).await;
                }
                IndexStatus::Invalid => {
                    warn!(index = %spec.index_name(), "dropping index left invalid by a failed build");
                    self.execute_ddl(ddl::drop_index(spec), SchemaObject::Index, spec.index())
                        .await?;
                    return Err(missing());
                }
                IndexStatus::Missing => return Err(missing()),
            }
        }
    }

    async fn is_empty(&self, spec: &SchemaSpec, value: &str) -> Result<bool, DriverError> {
        let mut guard = self.inner.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(disconnected)?;
        sqlx::query_scalar::<_, bool>(&ddl::is_empty(spec))
            .bind(value)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| self.inner.classify(e, SchemaObject::Table, spec.table()))
    }

    async fn get_all(&self, spec: &SchemaSpec, value: &str) -> Result<Cursor, DriverError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(disconnected());
        }
        let (tx, rx) = mpsc::channel(32);
        let inner = self.inner.clone();
        let sql = ddl::get_all(spec);
        let table = spec.table().to_string();
        let value = value.to_string();

        // Rows are streamed by a task that holds the connection until the
        // result set is exhausted or the cursor is dropped.
        tokio::spawn(async move {
            let mut guard = inner.conn.lock().await;
            let Some(conn) = guard.as_mut() else {
                let _ = tx.send(Err(disconnected())).await;
                return;
            };
            let mut rows = sqlx::query_scalar::<_, Json<Value>>(&sql)
                .bind(&value)
                .fetch(&mut *conn);
            while let Some(row) = rows.next().await {
                let item = row
                    .map(|Json(doc)| doc)
                    .map_err(|e| inner.classify(e, SchemaObject::Table, &table));
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        Cursor::primed(Box::pin(ReceiverStream::new(rx))).await
    }

    async fn insert(&self, spec: &SchemaSpec, doc: Value) -> Result<InsertSummary, DriverError> {
        let mut guard = self.inner.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(disconnected)?;
        let result = sqlx::query(&ddl::insert(spec))
            .bind(Json(doc))
            .execute(&mut *conn)
            .await
            .map_err(|e| self.inner.classify(e, SchemaObject::Index, &spec.index_name()))?;
        Ok(InsertSummary {
            inserted: result.rows_affected(),
        })
    }

    async fn close(&self) {
        let conn = self.inner.conn.lock().await.take();
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(conn) = conn
            && let Err(e) = conn.close().await
        {
            warn!(error = %e, "error while closing postgres connection");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionSignal> {
        self.inner.signals.subscribe()
    }
}
