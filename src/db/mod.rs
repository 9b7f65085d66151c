//! Backing document store: models, schema coordinates and drivers.
//!
//! Layout:
//! - `driver.rs`: `Connector`/`Connection` traits and the driver error taxonomy
//! - `models.rs`: the stored `User` document
//! - `schema.rs`: database/table/index names, bootstrap steps, PostgreSQL DDL
//! - `postgres.rs`: single-connection PostgreSQL driver (sqlx)
//! - `memory.rs`: in-process driver with fault injection

pub mod driver;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod schema;

pub use driver::{Connection, ConnectionSignal, Connector, Cursor, DriverError, InsertSummary};
pub use memory::MemoryStore;
pub use models::User;
pub use postgres::PostgresConnector;
pub use schema::{SchemaObject, SchemaSpec, SchemaStep, USERNAME_INDEX};
