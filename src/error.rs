use serde::Serialize;
use thiserror::Error as ThisError;

use crate::db::driver::DriverError;
use crate::db::schema::SchemaStep;

#[derive(Debug, ThisError)]
pub enum StoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Invalid identifier `{0}`: use ASCII letters, digits and `_`")]
    InvalidIdentifier(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Schema step {step} failed: {source}")]
    Schema {
        step: SchemaStep,
        #[source]
        source: DriverError,
    },

    #[error("Store is not set up; call set_up first")]
    NotReady,

    #[error("Invalid user: {0}")]
    InvalidUser(String),

    #[error("Username `{0}` is already in use")]
    DuplicateUser(String),

    #[error("Insert failed: {0}")]
    InsertFailed(String),

    #[error("User `{0}` not found")]
    NotFound(String),

    #[error("Found {count} records for username `{username}`")]
    DuplicateFound { username: String, count: usize },

    #[error("Cursor error: {0}")]
    Cursor(String),

    #[error("Store error: {0}")]
    Driver(DriverError),

    #[error("Document decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Ractor error: {0}")]
    RactorError(String),
}

impl From<figment::Error> for StoreError {
    fn from(e: figment::Error) -> Self {
        StoreError::Config(Box::new(e))
    }
}

impl From<DriverError> for StoreError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::Disconnected(msg) => StoreError::Connection(msg),
            other => StoreError::Driver(other),
        }
    }
}

impl StoreError {
    /// True when the failure came from losing (or never having) the connection.
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }

    /// Collapse the error into what the authentication layer may show an end user.
    pub fn public(&self) -> PublicError {
        match self {
            StoreError::DuplicateUser(_) => PublicError {
                code: "REGISTRATION_REJECTED".to_string(),
                message: "Registration was rejected.".to_string(),
            },
            StoreError::NotFound(_) => PublicError {
                code: "AUTHENTICATION_FAILED".to_string(),
                message: "Authentication failed.".to_string(),
            },
            _ => PublicError {
                code: "INTERNAL_ERROR".to_string(),
                message: "An internal error occurred.".to_string(),
            },
        }
    }
}

/// Error body safe to hand to an end user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicError {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::SchemaObject;

    #[test]
    fn disconnected_driver_error_becomes_connection_error() {
        let err: StoreError = DriverError::Disconnected("socket reset".to_string()).into();
        assert!(err.is_connection());
        assert!(err.to_string().contains("socket reset"));
    }

    #[test]
    fn other_driver_errors_are_kept() {
        let err: StoreError = DriverError::AlreadyExists {
            object: SchemaObject::Table,
            name: "users".to_string(),
        }
        .into();
        assert!(matches!(err, StoreError::Driver(DriverError::AlreadyExists { .. })));
    }

    #[test]
    fn public_errors_hide_internal_detail() {
        let dup = StoreError::DuplicateUser("alice".to_string()).public();
        assert_eq!(dup.code, "REGISTRATION_REJECTED");
        assert!(!dup.message.contains("alice"));

        let missing = StoreError::NotFound("bob".to_string()).public();
        assert_eq!(missing.code, "AUTHENTICATION_FAILED");

        let internal = StoreError::Cursor("row 3 truncated".to_string()).public();
        assert_eq!(internal.code, "INTERNAL_ERROR");
        assert!(!internal.message.contains("row 3"));

        let body = serde_json::to_string(&internal).expect("serialize public error");
        assert!(body.contains(r#""code":"INTERNAL_ERROR""#));
    }
}
