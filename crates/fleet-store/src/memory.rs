//! In-memory implementation of the document store.
//!
//! # Purpose
//! Implements [`DocumentStore`] with maps guarded by a `tokio::sync::RwLock`. It exists for local
//! development and tests, and as the default backend when no database is configured.
//!
//! # Durability and consistency
//! - **Not durable**: all state is lost on process restart.
//! - **Single-process consistency**: mutations take the write lock for their whole duration, so
//!   a multi-document replace is applied atomically with respect to other callers. A replace
//!   validates its batch in a per-call map and only then writes rows in place.
//!
//! # Unique keys
//! A table can declare a unique key over document fields with [`InMemoryStore::with_unique_key`],
//! mirroring the unique indexes of durable backends. Documents missing any key field are not
//! constrained.
use crate::{DocumentStore, Filter, StoreError, StoreResult, document_id};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Rows of one table, ordered by identifier so listings are stable.
type Table = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<HashMap<String, Table>>>,
    unique_keys: HashMap<String, Vec<String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes that would give two documents in `table` the same values for `fields`.
    pub fn with_unique_key(mut self, table: &str, fields: &[&str]) -> Self {
        self.unique_keys.insert(
            table.to_string(),
            fields.iter().map(|field| field.to_string()).collect(),
        );
        self
    }

    fn key_fields(&self, table_name: &str) -> Option<&[String]> {
        self.unique_keys.get(table_name).map(Vec::as_slice)
    }

    /// Identifier of a document other than `id` that shares `document`'s unique key.
    ///
    /// `staged` holds pending replacements that shadow rows with the same identifier.
    fn unique_clash(
        &self,
        table_name: &str,
        rows: &Table,
        staged: &Table,
        id: &str,
        document: &Value,
    ) -> Option<String> {
        let fields = self.key_fields(table_name)?;
        let key = unique_key(fields, document)?;
        let current = staged.get(id).or_else(|| rows.get(id));
        if current.and_then(|doc| unique_key(fields, doc)).as_ref() == Some(&key) {
            // The row already holds this key, and no other row can.
            return None;
        }
        let same_key = |other: &Value| unique_key(fields, other).as_ref() == Some(&key);
        staged
            .iter()
            .chain(rows.iter().filter(|(other_id, _)| !staged.contains_key(*other_id)))
            .filter(|(other_id, _)| other_id.as_str() != id)
            .find(|(_, other)| same_key(other))
            .map(|(other_id, _)| other_id.clone())
    }
}

/// Values of `fields` in `document`, or `None` when any is missing.
fn unique_key<'a>(fields: &[String], document: &'a Value) -> Option<Vec<&'a Value>> {
    fields.iter().map(|field| document.get(field)).collect()
}

/// Text rendering of a field, matching how SQL backends compare `entity ->> field`.
fn field_text(document: &Value, field: &str) -> Option<String> {
    match document.get(field)? {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn matches_all(document: &Value, filters: &[Filter]) -> bool {
    filters.iter().all(|filter| {
        field_text(document, &filter.field).as_deref() == Some(filter.value.as_str())
    })
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn insert(&self, table: &str, id: &str, document: Value) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_string()).or_default();
        if rows.contains_key(id)
            || self
                .unique_clash(table, rows, &Table::new(), id, &document)
                .is_some()
        {
            return Err(StoreError::Conflict {
                table: table.to_string(),
                id: id.to_string(),
            });
        }
        rows.insert(id.to_string(), document);
        Ok(())
    }

    async fn get(&self, table: &str, id: &str) -> StoreResult<Option<Value>> {
        let tables = self.tables.read().await;
        Ok(tables.get(table).and_then(|rows| rows.get(id)).cloned())
    }

    async fn filter(&self, table: &str, filters: &[Filter]) -> StoreResult<Vec<Value>> {
        let tables = self.tables.read().await;
        let Some(rows) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .values()
            .filter(|document| matches_all(document, filters))
            .cloned()
            .collect())
    }

    async fn replace(&self, table: &str, documents: Vec<Value>) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_string()).or_default();
        // Validate everything first so a bad document leaves the table untouched.
        let mut staged = Table::new();
        for document in documents {
            let id = document_id(table, &document)?.to_string();
            if !rows.contains_key(&id) {
                continue;
            }
            if self
                .unique_clash(table, rows, &staged, &id, &document)
                .is_some()
            {
                return Err(StoreError::Conflict {
                    table: table.to_string(),
                    id,
                });
            }
            staged.insert(id, document);
        }
        rows.extend(staged);
        Ok(())
    }

    async fn remove(&self, table: &str, id: &str) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .get_mut(table)
            .is_some_and(|rows| rows.remove(id).is_some()))
    }

    async fn health_check(&self) -> StoreResult<()> {
        // Nothing to probe: the store is alive as long as the process is.
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
