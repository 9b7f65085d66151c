//! Store services: the connection actor, schema bootstrap, the user repository
//! and the `UserStore` facade composing them.

pub mod bootstrap;
pub mod connection_actor;
pub mod user_repo;
pub mod user_store;

pub use bootstrap::{Readiness, SchemaBootstrapper};
pub use connection_actor::ConnectionHandle;
pub use user_repo::UserRepository;
pub use user_store::UserStore;
