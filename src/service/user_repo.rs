use tracing::{debug, error, info, warn};

use crate::db::driver::DriverError;
use crate::db::models::User;
use crate::db::schema::SchemaSpec;
use crate::error::StoreError;
use crate::service::connection_actor::ConnectionHandle;

/// Create and lookup of users through the username index.
#[derive(Clone)]
pub struct UserRepository {
    connections: ConnectionHandle,
    spec: SchemaSpec,
}

impl UserRepository {
    pub fn new(connections: ConnectionHandle, spec: SchemaSpec) -> Self {
        Self { connections, spec }
    }

    /// Insert a new user. Create-only: an existing username is never replaced.
    ///
    /// The existence check keeps the common duplicate path cheap; the unique
    /// index settles concurrent inserts that both pass it.
    pub async fn put(&self, user: &User) -> Result<(), StoreError> {
        if user.username.is_empty() {
            return Err(StoreError::InvalidUser("username is empty".to_string()));
        }
        let conn = self.connections.current().await?;

        let empty = conn.is_empty(&self.spec, &user.username).await?;
        if !empty {
            info!(username = %user.username, "Username in use");
            return Err(StoreError::DuplicateUser(user.username.clone()));
        }

        let doc = user.to_document()?;
        match conn.insert(&self.spec, doc).await {
            Ok(summary) if summary.inserted == 1 => {
                info!(username = %user.username, "User inserted");
                Ok(())
            }
            Ok(summary) => {
                error!(
                    username = %user.username,
                    inserted = summary.inserted,
                    "Store did not confirm a single insert"
                );
                Err(StoreError::InsertFailed(format!(
                    "expected 1 inserted record, store reported {}",
                    summary.inserted
                )))
            }
            Err(DriverError::UniqueViolation(index)) => {
                info!(username = %user.username, %index, "Lost insert race on unique index");
                Err(StoreError::DuplicateUser(user.username.clone()))
            }
            Err(e) => {
                warn!(username = %user.username, "User insert failed: {}", e);
                Err(StoreError::InsertFailed(e.to_string()))
            }
        }
    }

    /// Fetch the single user stored under `username`.
    pub async fn get(&self, username: &str) -> Result<User, StoreError> {
        let conn = self.connections.current().await?;
        let cursor = conn.get_all(&self.spec, username).await?;
        let mut docs = cursor.to_vec().await.map_err(|e| match e {
            DriverError::Disconnected(reason) => StoreError::Connection(reason),
            other => StoreError::Cursor(other.to_string()),
        })?;

        match docs.len() {
            0 => {
                debug!(username, "User not found");
                Err(StoreError::NotFound(username.to_string()))
            }
            1 => User::from_document(docs.remove(0)),
            count => {
                error!(username, count, "Multiple records share one username");
                Err(StoreError::DuplicateFound {
                    username: username.to_string(),
                    count,
                })
            }
        }
    }
}
