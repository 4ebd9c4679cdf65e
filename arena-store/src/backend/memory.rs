//! In-process document database.
//!
//! Implements the same [`DocumentDatabase`] contract as the Redis driver,
//! including equality indexes, without a server. Used for tests and for
//! embedding the remote code path in a single process. Connections and
//! writes can be made to fail on demand to exercise error handling.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::remote::{index_token, record_field, Connector, Document, DocumentDatabase, INTERNAL_ID};
use crate::error::{Result, StoreError};

#[derive(Debug, Default)]
struct MemoryCollection {
    documents: Vec<Document>,
    indexed_fields: BTreeSet<String>,
    /// field → token → internal ids
    indexes: HashMap<String, HashMap<String, Vec<String>>>,
}

impl MemoryCollection {
    fn index_document(&mut self, document: &Document) {
        for field in &self.indexed_fields {
            add_to_index(self.indexes.entry(field.clone()).or_default(), field, document);
        }
    }

    fn clear(&mut self) -> u64 {
        let removed = self.documents.len() as u64;
        self.documents.clear();
        self.indexes.clear();
        removed
    }

    fn scan(&self, field: &str, value: &Value) -> Vec<Document> {
        self.documents
            .iter()
            .filter(|d| record_field(d, field) == Some(value))
            .cloned()
            .collect()
    }
}

fn add_to_index(index: &mut HashMap<String, Vec<String>>, field: &str, document: &Document) {
    let id = document.get(INTERNAL_ID).and_then(Value::as_str);
    let token = record_field(document, field).and_then(index_token);
    if let (Some(id), Some(token)) = (id, token) {
        index.entry(token).or_default().push(id.to_string());
    }
}

/// Operation counters for [`MemoryDatabase`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub finds: u64,
    pub indexed_finds: u64,
    pub deletes: u64,
    pub inserts: u64,
}

/// A document database held in process memory.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    collections: Mutex<HashMap<String, MemoryCollection>>,
    fail_next_write: Mutex<HashSet<String>>,
    fail_next_insert: Mutex<HashSet<String>>,
    finds: AtomicU64,
    indexed_finds: AtomicU64,
    deletes: AtomicU64,
    inserts: AtomicU64,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next write on `collection` fail before it starts.
    pub fn fail_next_write(&self, collection: &str) {
        self.fail_next_write.lock().insert(collection.to_string());
    }

    /// Make the next insert on `collection` fail. In a replace this trips
    /// after the old documents were removed.
    pub fn fail_next_insert(&self, collection: &str) {
        self.fail_next_insert.lock().insert(collection.to_string());
    }

    /// Stored documents of `collection`, internal ids included.
    pub fn raw_documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .lock()
            .get(collection)
            .map(|c| c.documents.clone())
            .unwrap_or_default()
    }

    /// Indexed fields of `collection`.
    pub fn indexed_fields(&self, collection: &str) -> Vec<String> {
        self.collections
            .lock()
            .get(collection)
            .map(|c| c.indexed_fields.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            finds: self.finds.load(Ordering::Relaxed),
            indexed_finds: self.indexed_finds.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
        }
    }

    fn check_injected_failure(&self, collection: &str) -> Result<()> {
        if self.fail_next_write.lock().remove(collection) {
            return Err(StoreError::Database(format!(
                "injected write failure on {collection}"
            )));
        }
        Ok(())
    }

    fn check_injected_insert_failure(&self, collection: &str) -> Result<()> {
        if self.fail_next_insert.lock().remove(collection) {
            return Err(StoreError::Database(format!(
                "injected insert failure on {collection}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentDatabase for MemoryDatabase {
    async fn find_all(&self, collection: &str) -> Result<Vec<Document>> {
        self.finds.fetch_add(1, Ordering::Relaxed);
        Ok(self.raw_documents(collection))
    }

    async fn find_by(&self, collection: &str, field: &str, value: &Value) -> Result<Vec<Document>> {
        self.finds.fetch_add(1, Ordering::Relaxed);
        let collections = self.collections.lock();
        let Some(coll) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        // Null, arrays and objects have no index token.
        let token = index_token(value).filter(|_| coll.indexed_fields.contains(field));
        let Some(token) = token else {
            return Ok(coll.scan(field, value));
        };

        self.indexed_finds.fetch_add(1, Ordering::Relaxed);
        let ids: HashSet<&str> = coll
            .indexes
            .get(field)
            .and_then(|index| index.get(&token))
            .map(|ids| ids.iter().map(String::as_str).collect())
            .unwrap_or_default();
        Ok(coll
            .documents
            .iter()
            .filter(|d| {
                d.get(INTERNAL_ID)
                    .and_then(Value::as_str)
                    .is_some_and(|id| ids.contains(id))
            })
            .cloned()
            .collect())
    }

    async fn delete_all(&self, collection: &str) -> Result<u64> {
        self.check_injected_failure(collection)?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let mut collections = self.collections.lock();
        Ok(collections.entry(collection.to_string()).or_default().clear())
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<()> {
        self.check_injected_failure(collection)?;
        self.check_injected_insert_failure(collection)?;
        self.inserts.fetch_add(1, Ordering::Relaxed);
        let mut collections = self.collections.lock();
        let coll = collections.entry(collection.to_string()).or_default();
        for document in documents {
            coll.index_document(&document);
            coll.documents.push(document);
        }
        Ok(())
    }

    async fn replace(&self, collection: &str, documents: Vec<Document>) -> Result<u64> {
        self.check_injected_failure(collection)?;
        let mut collections = self.collections.lock();
        let coll = collections.entry(collection.to_string()).or_default();

        // Build the new content aside; it only becomes visible on success.
        let mut next = MemoryCollection {
            documents: Vec::with_capacity(documents.len()),
            indexed_fields: coll.indexed_fields.clone(),
            indexes: HashMap::new(),
        };
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let removed = coll.documents.len() as u64;
        if !documents.is_empty() {
            self.check_injected_insert_failure(collection)?;
            self.inserts.fetch_add(1, Ordering::Relaxed);
            for document in documents {
                next.index_document(&document);
                next.documents.push(document);
            }
        }
        *coll = next;
        Ok(removed)
    }

    async fn ensure_index(&self, collection: &str, field: &str) -> Result<bool> {
        let mut collections = self.collections.lock();
        let coll = collections.entry(collection.to_string()).or_default();
        if !coll.indexed_fields.insert(field.to_string()) {
            return Ok(false);
        }
        // Backfill documents stored before the index existed.
        let index = coll.indexes.entry(field.to_string()).or_default();
        index.clear();
        for document in &coll.documents {
            add_to_index(index, field, document);
        }
        Ok(true)
    }
}

/// Connector handing out a shared [`MemoryDatabase`].
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    database: Arc<MemoryDatabase>,
    refuse: Arc<AtomicU64>,
}

impl MemoryConnector {
    pub fn new(database: Arc<MemoryDatabase>) -> Self {
        Self {
            database,
            refuse: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.database
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connections(&self, count: u64) {
        self.refuse.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Database = Arc<MemoryDatabase>;

    async fn connect(&self) -> Result<Self::Database> {
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(StoreError::Connection {
                target: self.target(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(self.database.clone())
    }

    fn target(&self) -> String {
        "memory://".to_string()
    }
}
