use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{BackendKind, Config};
use crate::db::driver::Connector;
use crate::db::memory::MemoryStore;
use crate::db::models::User;
use crate::db::postgres::PostgresConnector;
use crate::error::StoreError;
use crate::service::bootstrap::{Readiness, SchemaBootstrapper};
use crate::service::connection_actor::ConnectionHandle;
use crate::service::user_repo::UserRepository;
use crate::types::{ConnectionEvent, ConnectionState};

/// Public surface used by the authentication layer.
///
/// Cloning is cheap; clones share the connection and the readiness flag.
#[derive(Clone)]
pub struct UserStore {
    connections: ConnectionHandle,
    bootstrapper: SchemaBootstrapper,
    users: UserRepository,
    ready: Arc<AtomicBool>,
}

impl UserStore {
    /// Build a store over an explicit connector. Nothing is contacted until
    /// [`UserStore::set_up`].
    pub async fn new(connector: Arc<dyn Connector>, cfg: &Config) -> Result<Self, StoreError> {
        let spec = cfg.schema()?;
        let connections = ConnectionHandle::spawn(
            connector,
            cfg.store.clone(),
            cfg.retry.clone(),
            cfg.connect_timeout(),
        )
        .await?;
        Ok(Self {
            bootstrapper: SchemaBootstrapper::new(spec.clone()),
            users: UserRepository::new(connections.clone(), spec),
            connections,
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Build a store over the backend named in the configuration.
    pub async fn from_config(cfg: &Config) -> Result<Self, StoreError> {
        let connector: Arc<dyn Connector> = match cfg.backend {
            BackendKind::Postgres => Arc::new(PostgresConnector::new(cfg.postgres.clone())),
            BackendKind::Memory => Arc::new(MemoryStore::new()),
        };
        Self::new(connector, cfg).await
    }

    /// Connect and make sure the schema is ready. Safe to call repeatedly.
    pub async fn set_up(&self) -> Result<Readiness, StoreError> {
        self.connections.connect().await?;
        let conn = self.connections.current().await?;
        let readiness = self.bootstrapper.ensure_ready(conn.as_ref()).await?;
        self.ready.store(true, Ordering::SeqCst);
        info!(?readiness, "User store set up");
        Ok(readiness)
    }

    pub async fn put(&self, user: &User) -> Result<(), StoreError> {
        self.ensure_set_up()?;
        self.users.put(user).await
    }

    pub async fn get(&self, username: &str) -> Result<User, StoreError> {
        self.ensure_set_up()?;
        self.users.get(username).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connections.subscribe()
    }

    pub async fn connection_state(&self) -> Result<ConnectionState, StoreError> {
        self.connections.state().await
    }

    /// Stop reconnecting and close the live connection.
    pub async fn close(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.connections.shutdown().await;
        info!("User store closed");
    }

    fn ensure_set_up(&self) -> Result<(), StoreError> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            warn!("User store used before set_up completed");
            Err(StoreError::NotReady)
        }
    }
}
