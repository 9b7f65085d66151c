//! Schema coordinates and the ordered bootstrap sequence.
//!
//! The store keeps users in one table of one database, with a unique secondary
//! index on the `username` field. Names come from configuration and end up
//! interpolated into DDL, so they are validated once when a [`SchemaSpec`] is
//! built.

use std::fmt;

use crate::error::StoreError;

/// Secondary index (and document field) used for uniqueness and lookup.
pub const USERNAME_INDEX: &str = "username";

/// Kind of schema object a bootstrap step creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaObject {
    Database,
    Table,
    Index,
}

impl fmt::Display for SchemaObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaObject::Database => f.write_str("database"),
            SchemaObject::Table => f.write_str("table"),
            SchemaObject::Index => f.write_str("index"),
        }
    }
}

/// One step of the creation sequence, run in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStep {
    CreateDatabase,
    CreateTable,
    CreateIndex,
    WaitIndex,
}

impl SchemaStep {
    pub const CREATION_SEQUENCE: [SchemaStep; 4] = [
        SchemaStep::CreateDatabase,
        SchemaStep::CreateTable,
        SchemaStep::CreateIndex,
        SchemaStep::WaitIndex,
    ];

    /// The object whose "already exists" failure this step treats as success.
    pub fn tolerated(self) -> Option<SchemaObject> {
        match self {
            SchemaStep::CreateDatabase => Some(SchemaObject::Database),
            SchemaStep::CreateTable => Some(SchemaObject::Table),
            SchemaStep::CreateIndex => Some(SchemaObject::Index),
            SchemaStep::WaitIndex => None,
        }
    }
}

impl fmt::Display for SchemaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaStep::CreateDatabase => f.write_str("create-database"),
            SchemaStep::CreateTable => f.write_str("create-table"),
            SchemaStep::CreateIndex => f.write_str("create-index"),
            SchemaStep::WaitIndex => f.write_str("wait-index"),
        }
    }
}

/// Validated database/table/index names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaSpec {
    db: String,
    table: String,
    index: String,
}

impl SchemaSpec {
    pub fn new(db: impl Into<String>, table: impl Into<String>) -> Result<Self, StoreError> {
        let db = validate_identifier(db.into())?;
        let table = validate_identifier(table.into())?;
        Ok(Self {
            db,
            table,
            index: USERNAME_INDEX.to_string(),
        })
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// Physical index name; unique per database.
    pub fn index_name(&self) -> String {
        format!("{}_{}_idx", self.table, self.index)
    }
}

fn validate_identifier(name: String) -> Result<String, StoreError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(StoreError::InvalidIdentifier(name))
    }
}

/// PostgreSQL DDL. `{db}` maps to a schema namespace, documents live in a JSONB
/// column, and the username index is a unique expression index.
pub(crate) mod postgres {
    use super::SchemaSpec;

    pub fn create_database(spec: &SchemaSpec) -> String {
        format!(r#"CREATE SCHEMA "{}""#, spec.db())
    }

    pub fn create_table(spec: &SchemaSpec) -> String {
        format!(
            r#"
            CREATE TABLE "{db}"."{table}" (
                id BIGSERIAL PRIMARY KEY,
                doc JSONB NOT NULL
            )
            "#,
            db = spec.db(),
            table = spec.table(),
        )
    }

    // CONCURRENTLY keeps the table writable while the index builds; it cannot
    // run inside a transaction block.
    pub fn create_index(spec: &SchemaSpec) -> String {
        format!(
            r#"CREATE UNIQUE INDEX CONCURRENTLY "{name}" ON "{db}"."{table}" ((doc->>'{field}'))"#,
            name = spec.index_name(),
            db = spec.db(),
            table = spec.table(),
            field = spec.index(),
        )
    }

    /// `(ready, building)` for the index: ready once it is valid and
    /// queryable, building while a `CREATE INDEX` still reports progress on it.
    pub const INDEX_STATUS: &str = r#"
        SELECT i.indisready AND i.indisvalid,
               EXISTS (
                   SELECT 1 FROM pg_stat_progress_create_index p
                   WHERE p.index_relid = i.indexrelid
               )
        FROM pg_index i
        JOIN pg_class c ON c.oid = i.indexrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1 AND c.relname = $2
    "#;

    pub fn drop_index(spec: &SchemaSpec) -> String {
        format!(
            r#"DROP INDEX CONCURRENTLY IF EXISTS "{db}"."{name}""#,
            db = spec.db(),
            name = spec.index_name(),
        )
    }

    pub fn is_empty(spec: &SchemaSpec) -> String {
        format!(
            r#"SELECT NOT EXISTS (SELECT 1 FROM "{db}"."{table}" WHERE doc->>'{field}' = $1)"#,
            db = spec.db(),
            table = spec.table(),
            field = spec.index(),
        )
    }

    pub fn get_all(spec: &SchemaSpec) -> String {
        format!(
            r#"SELECT doc FROM "{db}"."{table}" WHERE doc->>'{field}' = $1 ORDER BY id"#,
            db = spec.db(),
            table = spec.table(),
            field = spec.index(),
        )
    }

    pub fn insert(spec: &SchemaSpec) -> String {
        format!(
            r#"INSERT INTO "{db}"."{table}" (doc) VALUES ($1)"#,
            db = spec.db(),
            table = spec.table(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_identifiers() {
        let spec = SchemaSpec::new("users", "users_v2").expect("valid names");
        assert_eq!(spec.index(), USERNAME_INDEX);
        assert_eq!(spec.index_name(), "users_v2_username_idx");
    }

    #[test]
    fn rejects_injection_attempts() {
        for bad in ["", "1users", "users\"; DROP TABLE x; --", "us ers", "ユーザー"] {
            assert!(
                matches!(
                    SchemaSpec::new(bad, "users"),
                    Err(StoreError::InvalidIdentifier(_))
                ),
                "expected `{bad}` to be rejected"
            );
        }
        assert!(SchemaSpec::new("users", "a".repeat(64)).is_err());
    }

    #[test]
    fn creation_sequence_follows_dependency_order() {
        let tolerated: Vec<_> = SchemaStep::CREATION_SEQUENCE
            .iter()
            .map(|s| s.tolerated())
            .collect();
        assert_eq!(
            tolerated,
            vec![
                Some(SchemaObject::Database),
                Some(SchemaObject::Table),
                Some(SchemaObject::Index),
                None
            ]
        );
    }

    #[test]
    fn postgres_ddl_quotes_names() {
        let spec = SchemaSpec::new("auth", "users").expect("valid names");
        assert_eq!(postgres::create_database(&spec), r#"CREATE SCHEMA "auth""#);
        assert!(postgres::create_index(&spec).contains(r#"ON "auth"."users" ((doc->>'username'))"#));
        assert!(postgres::get_all(&spec).contains(r#"FROM "auth"."users""#));
        assert_eq!(
            postgres::drop_index(&spec),
            r#"DROP INDEX CONCURRENTLY IF EXISTS "auth"."users_username_idx""#
        );
    }
}
