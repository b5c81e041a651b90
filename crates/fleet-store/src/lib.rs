//! Document persistence for control-plane records.
//!
//! # Model
//! Every record lives in a named table, is keyed by an opaque string identifier, and is stored
//! as one self-describing JSON document whose embedded `id` field equals that identifier.
//! Records are created whole, replaced whole, and deleted by identifier; nothing is patched in
//! place.
//!
//! # Layers
//! - [`DocumentStore`] is the object-safe backend seam. It speaks `serde_json::Value` and knows
//!   nothing about entity types. Backends: [`memory::InMemoryStore`] and
//!   [`postgres::PostgresStore`].
//! - [`Repository`] is the typed front: it serializes an [`Entity`], enforces the entity's
//!   filterable-field allowlist, and maps documents back into values.
//!
//! # Errors
//! Write paths fail with [`StoreError::Write`] (or [`StoreError::Conflict`] when the backend
//! rejects a duplicate); read paths fail with [`StoreError::Query`]. Neither is retried here.
//! [`StoreError::Connect`] means the backend is unreachable and is what startup retries on.
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod memory;
pub mod postgres;
mod repository;

pub use memory::InMemoryStore;
pub use postgres::{PostgresConfig, PostgresStore};
pub use repository::{Entity, Repository};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One field-equals-value constraint. A filter list is a conjunction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub field: String,
    pub value: String,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The connection string itself is unusable; retrying cannot help.
    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),
    #[error("storage unreachable: {0}")]
    Connect(#[source] BoxError),
    #[error("write to {table} failed: {source}")]
    Write {
        table: String,
        #[source]
        source: BoxError,
    },
    #[error("query on {table} failed: {source}")]
    Query {
        table: String,
        #[source]
        source: BoxError,
    },
    /// A write collided with an existing identifier or unique key.
    #[error("conflicting record {id} in {table}")]
    Conflict { table: String, id: String },
}

impl StoreError {
    pub fn write(table: &str, source: impl Into<BoxError>) -> Self {
        StoreError::Write {
            table: table.to_string(),
            source: source.into(),
        }
    }

    pub fn query(table: &str, source: impl Into<BoxError>) -> Self {
        StoreError::Query {
            table: table.to_string(),
            source: source.into(),
        }
    }

    pub fn is_write_error(&self) -> bool {
        matches!(self, StoreError::Write { .. } | StoreError::Conflict { .. })
    }

    pub fn is_query_error(&self) -> bool {
        matches!(self, StoreError::Query { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Backend seam shared by every repository in a process.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document under `id`. A taken identifier is a [`StoreError::Conflict`].
    async fn insert(&self, table: &str, id: &str, document: Value) -> StoreResult<()>;
    async fn get(&self, table: &str, id: &str) -> StoreResult<Option<Value>>;
    /// Documents matching every filter; all documents when `filters` is empty.
    async fn filter(&self, table: &str, filters: &[Filter]) -> StoreResult<Vec<Value>>;
    /// Replace whole documents, each addressed by its own embedded `id` string.
    ///
    /// Unknown identifiers are skipped. Either every document is applied or none is.
    async fn replace(&self, table: &str, documents: Vec<Value>) -> StoreResult<()>;
    /// `true` only when exactly one document was removed.
    async fn remove(&self, table: &str, id: &str) -> StoreResult<bool>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> StoreResult<()>;
    /// Bring the schema up to date. Called once the backend answers [`Self::health_check`].
    async fn prepare(&self) -> StoreResult<()> {
        Ok(())
    }
    fn is_durable(&self) -> bool;
    fn backend_name(&self) -> &'static str;
}

/// The `id` string embedded in a document.
pub(crate) fn document_id<'a>(table: &str, document: &'a Value) -> StoreResult<&'a str> {
    document
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::write(table, "document has no string `id` field"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_id_requires_string() {
        assert_eq!(document_id("t", &json!({"id": "a"})).expect("id"), "a");
        let err = document_id("t", &json!({"id": 7})).unwrap_err();
        assert!(err.is_write_error());
        let err = document_id("t", &json!({})).unwrap_err();
        assert!(err.to_string().contains("no string `id`"), "{err}");
    }

    #[test]
    fn error_classes() {
        let conflict = StoreError::Conflict {
            table: "t".into(),
            id: "1".into(),
        };
        assert!(conflict.is_write_error());
        assert!(StoreError::query("t", "boom").is_query_error());
        assert_eq!(
            StoreError::write("t", "disk full").to_string(),
            "write to t failed: disk full"
        );
    }
}
