//! Backend abstraction: a [`Connector`] opens [`Connection`]s to a document
//! store that understands databases, tables and secondary indexes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;
use thiserror::Error as ThisError;
use tokio::sync::broadcast;

use crate::config::StoreCoordinates;
use crate::db::schema::{SchemaObject, SchemaSpec};

/// Raw backend failure, classified so callers can tell benign races apart from
/// real faults.
#[derive(Debug, Clone, ThisError)]
pub enum DriverError {
    #[error("{object} `{name}` already exists")]
    AlreadyExists { object: SchemaObject, name: String },

    #[error("{object} `{name}` does not exist")]
    NoSuchObject { object: SchemaObject, name: String },

    #[error("unique index `{0}` rejected a duplicate key")]
    UniqueViolation(String),

    #[error("connection lost: {0}")]
    Disconnected(String),

    #[error("query failed: {0}")]
    Query(String),
}

/// Notifications a live connection pushes to its observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// A non-fatal error was reported by the store.
    Error(String),
    /// The connection is gone and will not recover.
    Closed,
}

/// Outcome of an insert as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertSummary {
    pub inserted: u64,
}

/// Lazy handle over query results; must be drained before use.
pub struct Cursor {
    rows: BoxStream<'static, Result<Value, DriverError>>,
}

impl Cursor {
    pub fn new(rows: BoxStream<'static, Result<Value, DriverError>>) -> Self {
        Self { rows }
    }

    pub fn from_rows(rows: Vec<Value>) -> Self {
        Self::new(Box::pin(stream::iter(rows.into_iter().map(Ok))))
    }

    /// Wait for the first row so a failure of the query itself is returned
    /// here, not while draining.
    pub async fn primed(
        mut rows: BoxStream<'static, Result<Value, DriverError>>,
    ) -> Result<Self, DriverError> {
        match rows.next().await {
            None => Ok(Self::from_rows(Vec::new())),
            Some(first) => {
                let first = first?;
                Ok(Self::new(Box::pin(
                    stream::once(futures::future::ready(Ok(first))).chain(rows),
                )))
            }
        }
    }

    /// Drain every remaining row.
    pub async fn to_vec(self) -> Result<Vec<Value>, DriverError> {
        self.rows.try_collect().await
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor").finish_non_exhaustive()
    }
}

/// A single live connection. Operations take the schema coordinates explicitly;
/// the connection itself carries no schema state.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    async fn db_create(&self, spec: &SchemaSpec) -> Result<(), DriverError>;

    async fn table_create(&self, spec: &SchemaSpec) -> Result<(), DriverError>;

    /// Create the unique secondary index on `spec.index()`.
    async fn index_create(&self, spec: &SchemaSpec) -> Result<(), DriverError>;

    /// Resolve once the index is queryable. Fails when the index, its table or
    /// its database is missing.
    async fn index_wait(&self, spec: &SchemaSpec) -> Result<(), DriverError>;

    /// True when no document has `value` under the index.
    async fn is_empty(&self, spec: &SchemaSpec, value: &str) -> Result<bool, DriverError>;

    async fn get_all(&self, spec: &SchemaSpec, value: &str) -> Result<Cursor, DriverError>;

    async fn insert(&self, spec: &SchemaSpec, doc: Value) -> Result<InsertSummary, DriverError>;

    async fn close(&self);

    /// Register an observer for error/close notifications.
    fn subscribe(&self) -> broadcast::Receiver<ConnectionSignal>;
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        coordinates: &StoreCoordinates,
    ) -> Result<Arc<dyn Connection>, DriverError>;
}
