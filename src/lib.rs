pub mod config;
pub mod db;
pub mod error;
pub mod service;
pub mod types;

pub use config::Config;
pub use db::User;
pub use error::{PublicError, StoreError};
pub use service::{Readiness, UserStore};
