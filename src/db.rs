use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::StreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, FindOptions, IndexOptions};
use mongodb::{Client, Database, IndexModel};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

const DUPLICATE_KEY: i32 = 11000;

/// Unique keys besides `id`, which is unique in every collection.
const UNIQUE_KEYS: &[(&str, &str)] = &[("users", "email"), ("inventory", "qrCode")];

const COLLECTIONS: &[&str] = &[
    "users",
    "products",
    "productVariants",
    "inventory",
    "leads",
    "orders",
    "orderItems",
    "complaints",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key in {0}")]
    Duplicate(String),
    #[error("database error: {0}")]
    Backend(#[from] mongodb::error::Error),
    #[error("document codec error: {0}")]
    Codec(String),
}

impl From<bson::ser::Error> for StoreError {
    fn from(err: bson::ser::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

impl From<bson::de::Error> for StoreError {
    fn from(err: bson::de::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Generic access to named collections of BSON documents.
///
/// Filters are conjunctions of top-level equality matches; a `null` value
/// matches both an explicit null and a missing field. Sorts use the first
/// key of the sort document, `1` ascending and `-1` descending.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert(&self, collection: &str, document: Document) -> StoreResult<()>;

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> StoreResult<()>;

    async fn find_one(&self, collection: &str, filter: Document) -> StoreResult<Option<Document>>;

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        sort: Option<Document>,
    ) -> StoreResult<Vec<Document>>;

    /// Applies `$set` to the first document matching `filter`. Returns
    /// whether a document matched.
    async fn update_where(&self, collection: &str, filter: Document, set: Document) -> StoreResult<bool>;

    async fn delete_where(&self, collection: &str, filter: Document) -> StoreResult<bool>;
}

pub async fn connect(url: &str, database: &str) -> StoreResult<Arc<dyn DocumentStore>> {
    if url.starts_with("memory://") {
        log::warn!("Using the in-memory store; data is lost on exit");
        return Ok(Arc::new(MemoryStore::default()));
    }

    let client_options = ClientOptions::parse(url).await?;
    let client = Client::with_options(client_options)?;
    let store = MongoStore::new(client.database(database));
    store.ensure_indexes().await?;
    Ok(Arc::new(store))
}

pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    pub fn new(db: Database) -> Self {
        MongoStore { db }
    }

    pub async fn ensure_indexes(&self) -> StoreResult<()> {
        let unique = IndexOptions::builder().unique(true).build();
        for collection in COLLECTIONS {
            for key in unique_keys(collection) {
                let mut index_keys = Document::new();
                index_keys.insert(key, 1);
                let model = IndexModel::builder()
                    .keys(index_keys)
                    .options(unique.clone())
                    .build();
                self.db
                    .collection::<Document>(collection)
                    .create_index(model, None)
                    .await?;
            }
        }
        Ok(())
    }

    fn classify(collection: &str, err: mongodb::error::Error) -> StoreError {
        let duplicate = match err.kind.as_ref() {
            ErrorKind::Write(WriteFailure::WriteError(failure)) => failure.code == DUPLICATE_KEY,
            ErrorKind::BulkWrite(failure) => failure
                .write_errors
                .as_ref()
                .map_or(false, |errors| errors.iter().any(|e| e.code == DUPLICATE_KEY)),
            _ => false,
        };
        if duplicate {
            StoreError::Duplicate(collection.to_string())
        } else {
            StoreError::Backend(err)
        }
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn insert(&self, collection: &str, document: Document) -> StoreResult<()> {
        self.db
            .collection::<Document>(collection)
            .insert_one(document, None)
            .await
            .map_err(|e| Self::classify(collection, e))?;
        Ok(())
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> StoreResult<()> {
        if documents.is_empty() {
            return Ok(());
        }
        self.db
            .collection::<Document>(collection)
            .insert_many(documents, None)
            .await
            .map_err(|e| Self::classify(collection, e))?;
        Ok(())
    }

    async fn find_one(&self, collection: &str, filter: Document) -> StoreResult<Option<Document>> {
        Ok(self
            .db
            .collection::<Document>(collection)
            .find_one(filter, None)
            .await?)
    }

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        sort: Option<Document>,
    ) -> StoreResult<Vec<Document>> {
        let mut options = FindOptions::default();
        options.sort = sort;
        let mut cursor = self
            .db
            .collection::<Document>(collection)
            .find(filter, options)
            .await?;

        let mut documents = Vec::new();
        while let Some(result) = cursor.next().await {
            documents.push(result?);
        }
        Ok(documents)
    }

    async fn update_where(&self, collection: &str, filter: Document, set: Document) -> StoreResult<bool> {
        let result = self
            .db
            .collection::<Document>(collection)
            .update_one(filter, doc! { "$set": set }, None)
            .await
            .map_err(|e| Self::classify(collection, e))?;
        Ok(result.matched_count > 0)
    }

    async fn delete_where(&self, collection: &str, filter: Document) -> StoreResult<bool> {
        let result = self
            .db
            .collection::<Document>(collection)
            .delete_one(filter, None)
            .await?;
        Ok(result.deleted_count > 0)
    }
}

/// In-process store with the same matching and uniqueness rules as the
/// Mongo indexes. Serves tests and `memory://` development runs.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Document>>>,
}

fn bson_eq(a: &Bson, b: &Bson) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn as_number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

fn matches(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, expected)| match document.get(key) {
        None => matches!(expected, Bson::Null),
        Some(actual) => bson_eq(actual, expected),
    })
}

fn compare(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    match (a, b) {
        (Some(Bson::String(x)), Some(Bson::String(y))) => x.cmp(y),
        (Some(Bson::Boolean(x)), Some(Bson::Boolean(y))) => x.cmp(y),
        (Some(x), Some(y)) => match (as_number(x), as_number(y)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn unique_keys(collection: &str) -> impl Iterator<Item = &'static str> + '_ {
    std::iter::once("id").chain(
        UNIQUE_KEYS
            .iter()
            .filter(move |(name, _)| *name == collection)
            .map(|(_, key)| *key),
    )
}

/// Whether `candidate` collides on a unique key with any stored document
/// other than the one at `skip`.
fn collides(collection: &str, documents: &[Document], candidate: &Document, skip: Option<usize>) -> bool {
    unique_keys(collection).any(|key| match candidate.get(key) {
        None | Some(Bson::Null) => false,
        Some(value) => documents
            .iter()
            .enumerate()
            .any(|(i, other)| Some(i) != skip && other.get(key).map_or(false, |v| bson_eq(v, value))),
    })
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert(&self, collection: &str, document: Document) -> StoreResult<()> {
        self.insert_many(collection, vec![document]).await
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> StoreResult<()> {
        let mut collections = self.collections.lock();
        let stored = collections.entry(collection.to_string()).or_default();
        let mut staged = stored.clone();
        for document in documents {
            if collides(collection, &staged, &document, None) {
                return Err(StoreError::Duplicate(collection.to_string()));
            }
            staged.push(document);
        }
        *stored = staged;
        Ok(())
    }

    async fn find_one(&self, collection: &str, filter: Document) -> StoreResult<Option<Document>> {
        let collections = self.collections.lock();
        Ok(collections
            .get(collection)
            .and_then(|documents| documents.iter().find(|d| matches(d, &filter)).cloned()))
    }

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        sort: Option<Document>,
    ) -> StoreResult<Vec<Document>> {
        let mut found: Vec<Document> = {
            let collections = self.collections.lock();
            collections
                .get(collection)
                .map(|documents| documents.iter().filter(|d| matches(d, &filter)).cloned().collect())
                .unwrap_or_default()
        };

        if let Some((key, direction)) = sort.as_ref().and_then(|s| s.iter().next()) {
            let descending = as_number(direction).map_or(false, |d| d < 0.0);
            found.sort_by(|a, b| {
                let ordering = compare(a.get(key), b.get(key));
                if descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
        Ok(found)
    }

    async fn update_where(&self, collection: &str, filter: Document, set: Document) -> StoreResult<bool> {
        let mut collections = self.collections.lock();
        let Some(documents) = collections.get_mut(collection) else {
            return Ok(false);
        };
        let Some(index) = documents.iter().position(|d| matches(d, &filter)) else {
            return Ok(false);
        };

        let mut updated = documents[index].clone();
        for (key, value) in set {
            updated.insert(key, value);
        }
        if collides(collection, documents, &updated, Some(index)) {
            return Err(StoreError::Duplicate(collection.to_string()));
        }
        documents[index] = updated;
        Ok(true)
    }

    async fn delete_where(&self, collection: &str, filter: Document) -> StoreResult<bool> {
        let mut collections = self.collections.lock();
        let Some(documents) = collections.get_mut(collection) else {
            return Ok(false);
        };
        match documents.iter().position(|d| matches(d, &filter)) {
            Some(index) => {
                documents.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// A type stored as one document per record in its own collection.
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: &'static str;
}

pub fn newest_first() -> Option<Document> {
    Some(doc! { "createdAt": -1 })
}

/// Typed access to the document store.
#[derive(Clone)]
pub struct Db {
    store: Arc<dyn DocumentStore>,
}

impl Db {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Db { store }
    }

    pub async fn insert<T: Record>(&self, record: &T) -> StoreResult<()> {
        self.store
            .insert(T::COLLECTION, bson::to_document(record)?)
            .await
    }

    pub async fn insert_many<T: Record>(&self, records: &[T]) -> StoreResult<()> {
        let documents = records
            .iter()
            .map(bson::to_document)
            .collect::<Result<Vec<_>, _>>()?;
        self.store.insert_many(T::COLLECTION, documents).await
    }

    pub async fn get<T: Record>(&self, id: &str) -> StoreResult<Option<T>> {
        self.find_one(doc! { "id": id }).await
    }

    pub async fn find_one<T: Record>(&self, filter: Document) -> StoreResult<Option<T>> {
        match self.store.find_one(T::COLLECTION, filter).await? {
            Some(document) => Ok(Some(bson::from_document(document)?)),
            None => Ok(None),
        }
    }

    pub async fn find<T: Record>(&self, filter: Document, sort: Option<Document>) -> StoreResult<Vec<T>> {
        self.store
            .find(T::COLLECTION, filter, sort)
            .await?
            .into_iter()
            .map(|document| bson::from_document(document).map_err(StoreError::from))
            .collect()
    }

    pub async fn update<T: Record>(&self, id: &str, set: Document) -> StoreResult<bool> {
        self.update_where::<T>(doc! { "id": id }, set).await
    }

    pub async fn update_where<T: Record>(&self, filter: Document, set: Document) -> StoreResult<bool> {
        self.store.update_where(T::COLLECTION, filter, set).await
    }

    pub async fn delete<T: Record>(&self, id: &str) -> StoreResult<bool> {
        self.store.delete_where(T::COLLECTION, doc! { "id": id }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_web::test]
    async fn null_filter_matches_missing_field() {
        let store = MemoryStore::default();
        store
            .insert("inventory", doc! { "id": "a", "productId": "p", "qrCode": "QR-1" })
            .await
            .unwrap();

        let found = store
            .find_one("inventory", doc! { "productId": "p", "variantId": Bson::Null })
            .await
            .unwrap();
        assert!(found.is_some());

        let missing = store
            .find_one("inventory", doc! { "productId": "p", "variantId": "v" })
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[actix_web::test]
    async fn unique_keys_are_enforced_on_insert_and_update() {
        let store = MemoryStore::default();
        store
            .insert("users", doc! { "id": "1", "email": "a@x.io" })
            .await
            .unwrap();
        store
            .insert("users", doc! { "id": "2", "email": "b@x.io" })
            .await
            .unwrap();

        let dup = store.insert("users", doc! { "id": "3", "email": "a@x.io" }).await;
        assert!(matches!(dup, Err(StoreError::Duplicate(_))));

        let dup = store
            .update_where("users", doc! { "id": "2" }, doc! { "email": "a@x.io" })
            .await;
        assert!(matches!(dup, Err(StoreError::Duplicate(_))));

        // rewriting a document's own unique value is not a collision
        let same = store
            .update_where("users", doc! { "id": "1" }, doc! { "email": "a@x.io" })
            .await
            .unwrap();
        assert!(same);
    }

    #[actix_web::test]
    async fn failed_batch_leaves_collection_untouched() {
        let store = MemoryStore::default();
        let batch = vec![doc! { "id": "1" }, doc! { "id": "1" }];
        assert!(store.insert_many("orderItems", batch).await.is_err());
        let all = store.find("orderItems", doc! {}, None).await.unwrap();
        assert!(all.is_empty());
    }

    #[actix_web::test]
    async fn find_sorts_descending() {
        let store = MemoryStore::default();
        for (id, created) in [("a", "2026-01-01"), ("b", "2026-03-01"), ("c", "2026-02-01")] {
            store
                .insert("leads", doc! { "id": id, "createdAt": created })
                .await
                .unwrap();
        }
        let ids: Vec<String> = store
            .find("leads", doc! {}, newest_first())
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.get_str("id").unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[actix_web::test]
    async fn conditional_update_reports_mismatch() {
        let store = MemoryStore::default();
        store
            .insert("inventory", doc! { "id": "i", "quantity": 3_i64 })
            .await
            .unwrap();

        let stale = store
            .update_where("inventory", doc! { "id": "i", "quantity": 4_i64 }, doc! { "quantity": 0_i64 })
            .await
            .unwrap();
        assert!(!stale);

        let fresh = store
            .update_where("inventory", doc! { "id": "i", "quantity": 3_i64 }, doc! { "quantity": 1_i64 })
            .await
            .unwrap();
        assert!(fresh);
    }
}
