use crate::{DocumentStore, Filter, StoreError, StoreResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// A record kind that can be persisted.
///
/// The serialized form must be a JSON object whose `id` field is the value returned by
/// [`Entity::id`].
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TABLE: &'static str;
    /// Fields that may appear in a [`Filter`].
    const FILTER_FIELDS: &'static [&'static str];

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
}

/// Typed access to one entity's table.
pub struct Repository<E> {
    store: Arc<dyn DocumentStore>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for Repository<E> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> fmt::Debug for Repository<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("table", &E::TABLE)
            .field("backend", &self.store.backend_name())
            .finish()
    }
}

impl<E: Entity> Repository<E> {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            _entity: PhantomData,
        }
    }

    pub async fn create(&self, entity: &E) -> StoreResult<()> {
        let document = to_document(entity)?;
        self.store.insert(E::TABLE, entity.id(), document).await
    }

    pub async fn read(&self, id: &str) -> StoreResult<Option<E>> {
        match self.store.get(E::TABLE, id).await? {
            Some(document) => from_document(document).map(Some),
            None => Ok(None),
        }
    }

    pub async fn filter(&self, filters: &[Filter]) -> StoreResult<Vec<E>> {
        for filter in filters {
            if !E::FILTER_FIELDS.contains(&filter.field.as_str()) {
                return Err(StoreError::query(
                    E::TABLE,
                    format!("disallowed filter field {:?}", filter.field),
                ));
            }
        }
        self.store
            .filter(E::TABLE, filters)
            .await?
            .into_iter()
            .map(from_document)
            .collect()
    }

    pub async fn read_all(&self) -> StoreResult<Vec<E>> {
        self.filter(&[]).await
    }

    /// Replace each entity's stored document, addressed by the `id` inside it.
    pub async fn bulk_update(&self, entities: &[E]) -> StoreResult<()> {
        let documents = entities
            .iter()
            .map(to_document)
            .collect::<StoreResult<Vec<_>>>()?;
        self.store.replace(E::TABLE, documents).await
    }

    pub async fn delete(&self, id: &str) -> StoreResult<bool> {
        self.store.remove(E::TABLE, id).await
    }
}

fn to_document<E: Entity>(entity: &E) -> StoreResult<serde_json::Value> {
    serde_json::to_value(entity).map_err(|err| StoreError::write(E::TABLE, err))
}

fn from_document<E: Entity>(document: serde_json::Value) -> StoreResult<E> {
    serde_json::from_value(document).map_err(|err| StoreError::query(E::TABLE, err))
}
