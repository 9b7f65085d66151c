use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// A registered principal as stored in the users table.
///
/// `password_hash` is produced by an external hashing primitive and is only
/// ever stored and returned, never inspected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub username: String,
    pub password_hash: String,
    pub email: String,
}

impl User {
    pub fn new(
        username: impl Into<String>,
        password_hash: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password_hash: password_hash.into(),
            email: email.into(),
        }
    }

    pub(crate) fn to_document(&self) -> Result<Value, StoreError> {
        Ok(serde_json::to_value(self)?)
    }

    pub(crate) fn from_document(doc: Value) -> Result<Self, StoreError> {
        Ok(serde_json::from_value(doc)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_uses_camel_case_fields() {
        let user = User::new("alice", "h1", "a@x.com");
        let doc = user.to_document().expect("serialize user");
        assert_eq!(
            doc,
            json!({"username": "alice", "passwordHash": "h1", "email": "a@x.com"})
        );
    }

    #[test]
    fn extra_store_fields_are_ignored() {
        let doc = json!({
            "id": "3f1c",
            "username": "bob",
            "passwordHash": "h2",
            "email": "b@x.com"
        });
        let user = User::from_document(doc).expect("decode user");
        assert_eq!(user, User::new("bob", "h2", "b@x.com"));
    }

    #[test]
    fn malformed_document_is_a_decode_error() {
        let err = User::from_document(json!({"username": 7})).unwrap_err();
        assert!(matches!(err, StoreError::Decode(_)));
    }
}
