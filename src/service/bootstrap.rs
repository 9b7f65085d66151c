use tracing::{debug, error, info};

use crate::db::driver::{Connection, DriverError};
use crate::db::schema::{SchemaSpec, SchemaStep};
use crate::error::StoreError;

/// How `ensure_ready` found the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The readiness probe succeeded; nothing was created.
    AlreadyProvisioned,
    /// The creation sequence ran to completion.
    Provisioned,
}

/// Makes sure the users database, table and username index exist and are ready.
#[derive(Debug, Clone)]
pub struct SchemaBootstrapper {
    spec: SchemaSpec,
}

impl SchemaBootstrapper {
    pub fn new(spec: SchemaSpec) -> Self {
        Self { spec }
    }

    pub async fn ensure_ready(&self, conn: &dyn Connection) -> Result<Readiness, StoreError> {
        match conn.index_wait(&self.spec).await {
            Ok(()) => {
                info!(
                    db = self.spec.db(),
                    table = self.spec.table(),
                    "Table and index are available"
                );
                return Ok(Readiness::AlreadyProvisioned);
            }
            Err(DriverError::Disconnected(reason)) => return Err(StoreError::Connection(reason)),
            Err(e) => debug!("Readiness probe failed ({}); provisioning schema", e),
        }

        for step in SchemaStep::CREATION_SEQUENCE {
            self.run_step(conn, step).await?;
        }
        info!(
            db = self.spec.db(),
            table = self.spec.table(),
            index = self.spec.index(),
            "Schema provisioned"
        );
        Ok(Readiness::Provisioned)
    }

    async fn run_step(&self, conn: &dyn Connection, step: SchemaStep) -> Result<(), StoreError> {
        let result = match step {
            SchemaStep::CreateDatabase => conn.db_create(&self.spec).await,
            SchemaStep::CreateTable => conn.table_create(&self.spec).await,
            SchemaStep::CreateIndex => conn.index_create(&self.spec).await,
            SchemaStep::WaitIndex => conn.index_wait(&self.spec).await,
        };
        match result {
            Ok(()) => {
                info!(%step, "Schema step done");
                Ok(())
            }
            Err(DriverError::AlreadyExists { object, name }) if step.tolerated() == Some(object) => {
                info!(%step, %object, %name, "Already exists; continuing");
                Ok(())
            }
            Err(DriverError::Disconnected(reason)) => {
                error!(%step, "Connection lost during bootstrap: {}", reason);
                Err(StoreError::Connection(reason))
            }
            Err(source) => {
                error!(%step, "Schema step failed: {}", source);
                Err(StoreError::Schema { step, source })
            }
        }
    }
}
