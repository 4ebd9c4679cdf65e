//! Networked document-database backend.
//!
//! Each [`Collection`] maps to its own addressable set of documents. There is
//! no diffing at the storage level, so replacing a collection is "delete all,
//! then insert the survivors", issued to the driver as one atomic replace.
//!
//! ```text
//! RemoteBackend
//!   │  first call ──► connect (bounded by connect_timeout)
//!   │                 ensure_index × every indexed field
//!   │                 memoize ── on failure nothing is kept, next call retries
//!   ▼
//! DocumentDatabase
//!   users ─► [ {_id, _value: {id, email, ..}}, .. ]     idx: id, email, username
//!   posts ─► [ {_id, _value: {id, authorId, ..}}, .. ]  idx: id, authorId
//!   ...
//! ```
//!
//! `_id` is the database's own identity, assigned on insert. The caller's
//! record is stored untouched under `_value`, so whatever was written is
//! exactly what is read back, fields named `_id` included. Indexes look up
//! fields of the record, see [`record_field`].
//!
//! Multi-collection writes replace each changed collection concurrently. If
//! some replacements fail, the others stay committed and the call reports
//! [`StoreError::PartialWrite`] naming both sides.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{join_all, try_join_all};
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use uuid::Uuid;

use super::{AtomicBackendStats, Backend, BackendStats};
use crate::config::BackendKind;
use crate::error::{Result, StoreError};
use crate::schema::{Collection, Graph};

/// Field holding the database's internal identity.
pub const INTERNAL_ID: &str = "_id";

/// Field holding the caller's record inside its document.
pub const WRAPPED_VALUE: &str = "_value";

/// A stored document: `{_id, _value}`.
pub type Document = Map<String, Value>;

/// Raw document operations offered by a database driver.
#[async_trait]
pub trait DocumentDatabase: Send + Sync {
    /// Every document of `collection`, in insertion order.
    async fn find_all(&self, collection: &str) -> Result<Vec<Document>>;

    /// Documents whose `field` equals `value`, in insertion order.
    async fn find_by(&self, collection: &str, field: &str, value: &Value) -> Result<Vec<Document>>;

    /// Remove every document of `collection`. Returns how many were removed.
    async fn delete_all(&self, collection: &str) -> Result<u64>;

    /// Append `documents` to `collection`.
    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<()>;

    /// Atomically swap the whole content of `collection` for `documents`.
    /// Returns how many documents were removed. On error nothing changed.
    async fn replace(&self, collection: &str, documents: Vec<Document>) -> Result<u64>;

    /// Create an equality index on `field`. Returns `false` if it already existed.
    async fn ensure_index(&self, collection: &str, field: &str) -> Result<bool>;
}

#[async_trait]
impl<D: DocumentDatabase + ?Sized> DocumentDatabase for Arc<D> {
    async fn find_all(&self, collection: &str) -> Result<Vec<Document>> {
        (**self).find_all(collection).await
    }

    async fn find_by(&self, collection: &str, field: &str, value: &Value) -> Result<Vec<Document>> {
        (**self).find_by(collection, field, value).await
    }

    async fn delete_all(&self, collection: &str) -> Result<u64> {
        (**self).delete_all(collection).await
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<()> {
        (**self).insert_many(collection, documents).await
    }

    async fn replace(&self, collection: &str, documents: Vec<Document>) -> Result<u64> {
        (**self).replace(collection, documents).await
    }

    async fn ensure_index(&self, collection: &str, field: &str) -> Result<bool> {
        (**self).ensure_index(collection, field).await
    }
}

/// Opens connections to a document database.
#[async_trait]
pub trait Connector: Send + Sync {
    type Database: DocumentDatabase + 'static;

    async fn connect(&self) -> Result<Self::Database>;

    /// Human-readable target for logs and errors.
    fn target(&self) -> String;
}

/// Backend storing one document set per collection.
pub struct RemoteBackend<C: Connector> {
    connector: C,
    connect_timeout: Duration,
    database: OnceCell<C::Database>,
    stats: AtomicBackendStats,
}

impl<C: Connector> RemoteBackend<C> {
    pub fn new(connector: C, connect_timeout: Duration) -> Self {
        Self {
            connector,
            connect_timeout,
            database: OnceCell::new(),
            stats: AtomicBackendStats::default(),
        }
    }

    /// Whether a connection has been established and memoized.
    pub fn is_connected(&self) -> bool {
        self.database.initialized()
    }

    /// The memoized connection, establishing it on first use.
    async fn database(&self) -> Result<&C::Database> {
        self.database.get_or_try_init(|| self.connect()).await
    }

    async fn connect(&self) -> Result<C::Database> {
        self.stats.connect();
        let target = self.connector.target();
        log::info!("Connecting to document database at {target}");

        let database = match tokio::time::timeout(self.connect_timeout, self.connector.connect()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(StoreError::Timeout {
                    target,
                    timeout: self.connect_timeout,
                })
            }
        };

        let mut created = 0;
        for collection in Collection::ALL {
            for field in collection.indexed_fields() {
                if database.ensure_index(collection.as_str(), field).await? {
                    created += 1;
                }
            }
        }
        log::info!("Connected to {target} ({created} indexes created)");
        Ok(database)
    }

    async fn fetch(&self, database: &C::Database, collection: Collection) -> Result<Vec<Value>> {
        let documents = database.find_all(collection.as_str()).await?;
        Ok(documents.into_iter().map(from_document).collect())
    }

    async fn replace(&self, database: &C::Database, collection: Collection, records: &[Value]) -> Result<()> {
        self.stats.write();
        let documents = records.iter().cloned().map(to_document).collect();
        let removed = database.replace(collection.as_str(), documents).await?;
        log::debug!(
            "Replaced {collection}: {removed} documents removed, {} inserted",
            records.len()
        );
        Ok(())
    }
}

#[async_trait]
impl<C: Connector> Backend for RemoteBackend<C> {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn read_all(&self) -> Result<Graph> {
        let database = self.database().await?;
        self.stats.read();
        let fetched = try_join_all(
            Collection::ALL
                .into_iter()
                .map(|c| async move { self.fetch(database, c).await.map(|records| (c, records)) }),
        )
        .await?;

        let mut graph = Graph::empty();
        for (collection, records) in fetched {
            graph.set(collection, records);
        }
        Ok(graph)
    }

    async fn read_collection(&self, collection: Collection) -> Result<Vec<Value>> {
        let database = self.database().await?;
        self.stats.read();
        self.fetch(database, collection).await
    }

    async fn write_all(&self, graph: &Graph, changed: &[Collection]) -> Result<()> {
        if changed.is_empty() {
            return Ok(());
        }
        let database = self.database().await?;
        let outcomes = join_all(changed.iter().map(|&c| async move {
            (c, self.replace(database, c, graph.get(c)).await)
        }))
        .await;

        let mut committed = Vec::new();
        let mut failed = Vec::new();
        for (collection, outcome) in outcomes {
            match outcome {
                Ok(()) => committed.push(collection),
                Err(e) => failed.push((collection, e.to_string())),
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(StoreError::PartialWrite { committed, failed })
        }
    }

    async fn replace_collection(&self, collection: Collection, records: &[Value]) -> Result<()> {
        let database = self.database().await?;
        self.replace(database, collection, records).await
    }

    async fn find_by(&self, collection: Collection, field: &str, value: &Value) -> Result<Vec<Value>> {
        let database = self.database().await?;
        self.stats.read();
        let documents = database.find_by(collection.as_str(), field, value).await?;
        Ok(documents.into_iter().map(from_document).collect())
    }

    fn stats(&self) -> BackendStats {
        self.stats.snapshot()
    }
}

/// Wrap a record for storage under a fresh internal identity.
pub fn to_document(record: Value) -> Document {
    let mut document = Map::new();
    document.insert(INTERNAL_ID.to_string(), Value::String(Uuid::new_v4().to_string()));
    document.insert(WRAPPED_VALUE.to_string(), record);
    document
}

/// The caller's record inside a stored document.
pub fn from_document(mut document: Document) -> Value {
    match document.remove(WRAPPED_VALUE) {
        Some(record) => record,
        // Flat documents written by other tools.
        None => {
            document.remove(INTERNAL_ID);
            Value::Object(document)
        }
    }
}

/// The record field `field` of a stored document, as indexes and lookups see it.
pub fn record_field<'d>(document: &'d Document, field: &str) -> Option<&'d Value> {
    document.get(WRAPPED_VALUE)?.get(field)
}

/// Index key token for a field value. Only scalars are indexable.
pub fn index_token(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(format!("s:{s}")),
        Value::Number(n) => Some(format!("n:{n}")),
        Value::Bool(b) => Some(format!("b:{b}")),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
