//! Document store abstraction: three collections of JSON documents with
//! store-assigned ids, plus the typed record layer on top of it.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Users,
    Media,
    Messages,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::Users, Collection::Media, Collection::Messages];

    /// Name of the collection inside the store.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Media => "media",
            Collection::Messages => "messages",
        }
    }

    /// Name the collection is exposed under on the read endpoints.
    #[must_use]
    pub fn public_name(self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Media => "media",
            Collection::Messages => "wishes",
        }
    }

    #[must_use]
    pub fn from_public_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.public_name() == name)
    }
}

/// A stored document: its id and every other field.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound,
    Backend(String),
    Schema(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "document not found"),
            StoreError::Backend(msg) => write!(f, "document store error: {msg}"),
            StoreError::Schema(msg) => write!(f, "document schema error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document and return the id the store assigned to it.
    async fn add(&self, collection: Collection, record: Map<String, Value>)
        -> Result<String, StoreError>;

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError>;

    /// All documents of a collection, in insertion order.
    async fn list(&self, collection: Collection) -> Result<Vec<Document>, StoreError>;

    /// Documents whose `field` equals `value`, in insertion order.
    async fn query(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Document>, StoreError>;
}

/// Process-local store, used when no database is configured and in tests.
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<Collection, Vec<Document>>>,
}

impl MemoryDocumentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document under a caller-chosen id. Used to seed historical rows.
    pub async fn insert_with_id(&self, collection: Collection, id: &str, fields: Value) {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.collections
            .write()
            .await
            .entry(collection)
            .or_default()
            .push(Document {
                id: id.to_string(),
                fields,
            });
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn add(
        &self,
        collection: Collection,
        record: Map<String, Value>,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        self.collections
            .write()
            .await
            .entry(collection)
            .or_default()
            .push(Document {
                id: id.clone(),
                fields: record,
            });
        Ok(id)
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(&collection)
            .and_then(|docs| docs.iter().find(|d| d.id == id))
            .cloned())
    }

    async fn list(&self, collection: Collection) -> Result<Vec<Document>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections.get(&collection).cloned().unwrap_or_default())
    }

    async fn query(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Document>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(&collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| d.fields.get(field) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// A typed record living in one collection.
pub trait Record: Serialize + DeserializeOwned + Send {
    const COLLECTION: Collection;

    fn set_id(&mut self, id: String);
}

/// Serialize a record into stored fields. The id is owned by the store and never written.
pub fn encode<T: Record>(record: &T) -> Result<Map<String, Value>, StoreError> {
    match serde_json::to_value(record) {
        Ok(Value::Object(mut map)) => {
            map.remove("id");
            Ok(map)
        }
        Ok(other) => Err(StoreError::Schema(format!(
            "{} record serialized to non-object {other}",
            T::COLLECTION.as_str()
        ))),
        Err(err) => Err(StoreError::Schema(err.to_string())),
    }
}

pub fn decode<T: Record>(doc: Document) -> Result<T, StoreError> {
    let Document { id, mut fields } = doc;
    fields.insert("id".to_string(), Value::String(id.clone()));
    serde_json::from_value(Value::Object(fields)).map_err(|err| {
        StoreError::Schema(format!(
            "{} document {id} does not match schema: {err}",
            T::COLLECTION.as_str()
        ))
    })
}

/// Write a new record and return it with its assigned id.
pub async fn insert<T: Record>(store: &dyn DocumentStore, mut record: T) -> Result<T, StoreError> {
    let fields = encode(&record)?;
    let id = store.add(T::COLLECTION, fields).await?;
    record.set_id(id);
    Ok(record)
}

pub async fn fetch_one<T: Record>(store: &dyn DocumentStore, id: &str) -> Result<Option<T>, StoreError> {
    match store.get(T::COLLECTION, id).await? {
        Some(doc) => decode(doc).map(Some),
        None => Ok(None),
    }
}

pub async fn fetch_all<T: Record>(store: &dyn DocumentStore) -> Result<Vec<T>, StoreError> {
    Ok(quarantine(store.list(T::COLLECTION).await?))
}

pub async fn fetch_where<T: Record>(
    store: &dyn DocumentStore,
    field: &str,
    value: &Value,
) -> Result<Vec<T>, StoreError> {
    Ok(quarantine(store.query(T::COLLECTION, field, value).await?))
}

/// Decode every document, dropping (and reporting) the ones that do not fit the schema.
fn quarantine<T: Record>(docs: Vec<Document>) -> Vec<T> {
    docs.into_iter()
        .filter_map(|doc| match decode::<T>(doc) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(collection = T::COLLECTION.as_str(), error = %err, "Quarantined document");
                sentry::add_breadcrumb(sentry::Breadcrumb {
                    category: Some("documents".into()),
                    message: Some(err.to_string()),
                    level: sentry::Level::Warning,
                    ..Default::default()
                });
                None
            }
        })
        .collect()
}
