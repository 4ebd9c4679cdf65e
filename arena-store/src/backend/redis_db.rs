//! Redis document database driver.
//!
//! Key layout per collection, under the configured namespace `ns`:
//!
//! | Key                              | Type | Content                         |
//! |----------------------------------|------|---------------------------------|
//! | `ns:{coll}:order`                | LIST | `_id`s in insertion order       |
//! | `ns:{coll}:docs`                 | HASH | `_id` → JSON document           |
//! | `ns:{coll}:indexes`              | SET  | indexed field names             |
//! | `ns:{coll}:idx:{field}:{token}`  | SET  | `_id`s whose field equals token |
//! | `ns:{coll}:idxkeys`              | SET  | populated index keys            |
//!
//! Documents are stored as `{_id, _value}` JSON; index tokens come from the
//! fields of `_value`. `delete_all`, `insert_many` and `replace` each run as
//! one `MULTI` pipeline, so a reader never observes a half-replaced
//! collection and a failed replace leaves the old documents in place.

use std::collections::HashSet;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Pipeline};
use serde_json::Value;

use super::remote::{index_token, record_field, Connector, Document, DocumentDatabase, INTERNAL_ID};
use crate::error::{Result, StoreError};

/// Opens a managed Redis connection.
pub struct RedisConnector {
    client: Client,
    url: String,
    namespace: String,
}

impl RedisConnector {
    /// Validate `url` without connecting.
    pub fn new(url: &str, namespace: impl Into<String>) -> Result<Self> {
        let client = Client::open(url).map_err(|e| StoreError::Connection {
            target: url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            client,
            url: url.to_string(),
            namespace: namespace.into(),
        })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Database = RedisDatabase;

    async fn connect(&self) -> Result<RedisDatabase> {
        let connection = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection {
                target: self.url.clone(),
                reason: e.to_string(),
            })?;
        Ok(RedisDatabase {
            connection,
            namespace: self.namespace.clone(),
        })
    }

    fn target(&self) -> String {
        format!("{} (namespace {})", self.url, self.namespace)
    }
}

/// Document collections stored in Redis.
#[derive(Clone)]
pub struct RedisDatabase {
    connection: ConnectionManager,
    namespace: String,
}

impl RedisDatabase {
    fn key(&self, collection: &str, suffix: &str) -> String {
        format!("{}:{collection}:{suffix}", self.namespace)
    }

    fn index_key(&self, collection: &str, field: &str, token: &str) -> String {
        format!("{}:{collection}:idx:{field}:{token}", self.namespace)
    }

    async fn load(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(self.key(collection, "docs"));
        for id in ids {
            cmd.arg(id);
        }
        let mut conn = self.connection.clone();
        let raw: Vec<Option<String>> = cmd.query_async(&mut conn).await?;

        let mut documents = Vec::with_capacity(raw.len());
        for json in raw.into_iter().flatten() {
            match serde_json::from_str::<Value>(&json)? {
                Value::Object(document) => documents.push(document),
                other => {
                    log::warn!("Skipping non-object document in {collection}: {other}");
                }
            }
        }
        Ok(documents)
    }

    async fn members(&self, key: &str) -> Result<HashSet<String>> {
        let mut conn = self.connection.clone();
        let members: HashSet<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }

    async fn indexed_fields(&self, collection: &str) -> Result<HashSet<String>> {
        self.members(&self.key(collection, "indexes")).await
    }

    /// Queue `LLEN order` (the only reply kept) and the removal of every key
    /// of `collection`.
    fn queue_delete(&self, pipe: &mut Pipeline, collection: &str, index_keys: &HashSet<String>) {
        let order_key = self.key(collection, "order");
        pipe.cmd("LLEN").arg(&order_key);
        pipe.cmd("DEL")
            .arg(&order_key)
            .arg(self.key(collection, "docs"))
            .arg(self.key(collection, "idxkeys"))
            .ignore();
        for key in index_keys {
            pipe.cmd("DEL").arg(key).ignore();
        }
    }

    /// Queue the append of `documents`, indexing `fields`. Nothing is replied.
    fn queue_insert(
        &self,
        pipe: &mut Pipeline,
        collection: &str,
        documents: &[Document],
        fields: &HashSet<String>,
    ) -> Result<()> {
        let order_key = self.key(collection, "order");
        let docs_key = self.key(collection, "docs");
        let idxkeys_key = self.key(collection, "idxkeys");
        for document in documents {
            let Some(id) = document.get(INTERNAL_ID).and_then(Value::as_str) else {
                return Err(StoreError::Database(format!(
                    "document without {INTERNAL_ID} in {collection}"
                )));
            };
            pipe.cmd("RPUSH").arg(&order_key).arg(id).ignore();
            pipe.cmd("HSET")
                .arg(&docs_key)
                .arg(id)
                .arg(serde_json::to_string(document)?)
                .ignore();
            for field in fields {
                if let Some(token) = record_field(document, field).and_then(index_token) {
                    let key = self.index_key(collection, field, &token);
                    pipe.cmd("SADD").arg(&key).arg(id).ignore();
                    pipe.cmd("SADD").arg(&idxkeys_key).arg(&key).ignore();
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentDatabase for RedisDatabase {
    async fn find_all(&self, collection: &str) -> Result<Vec<Document>> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(self.key(collection, "order"))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        self.load(collection, &ids).await
    }

    async fn find_by(&self, collection: &str, field: &str, value: &Value) -> Result<Vec<Document>> {
        let token = match index_token(value) {
            Some(token) if self.indexed_fields(collection).await?.contains(field) => token,
            // Unindexed field, or a value with no token: scan.
            _ => {
                let all = self.find_all(collection).await?;
                return Ok(all
                    .into_iter()
                    .filter(|d| record_field(d, field) == Some(value))
                    .collect());
            }
        };

        let members = self.members(&self.index_key(collection, field, &token)).await?;
        if members.is_empty() {
            return Ok(Vec::new());
        }
        // Keep insertion order: walk the order list and pick the members.
        let mut conn = self.connection.clone();
        let order: Vec<String> = redis::cmd("LRANGE")
            .arg(self.key(collection, "order"))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        let ids: Vec<String> = order.into_iter().filter(|id| members.contains(id)).collect();
        self.load(collection, &ids).await
    }

    async fn delete_all(&self, collection: &str) -> Result<u64> {
        let index_keys = self.members(&self.key(collection, "idxkeys")).await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.queue_delete(&mut pipe, collection, &index_keys);

        let mut conn = self.connection.clone();
        let (removed,): (u64,) = pipe.query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let fields = self.indexed_fields(collection).await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.queue_insert(&mut pipe, collection, &documents, &fields)?;

        let mut conn = self.connection.clone();
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn replace(&self, collection: &str, documents: Vec<Document>) -> Result<u64> {
        let index_keys = self.members(&self.key(collection, "idxkeys")).await?;
        let fields = self.indexed_fields(collection).await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.queue_delete(&mut pipe, collection, &index_keys);
        self.queue_insert(&mut pipe, collection, &documents, &fields)?;

        let mut conn = self.connection.clone();
        let (removed,): (u64,) = pipe.query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn ensure_index(&self, collection: &str, field: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let added: u64 = redis::cmd("SADD")
            .arg(self.key(collection, "indexes"))
            .arg(field)
            .query_async(&mut conn)
            .await?;
        if added == 0 {
            return Ok(false);
        }

        // Backfill documents stored before the index existed.
        let existing = self.find_all(collection).await?;
        if !existing.is_empty() {
            let idxkeys_key = self.key(collection, "idxkeys");
            let mut pipe = redis::pipe();
            pipe.atomic();
            for document in &existing {
                let id = document.get(INTERNAL_ID).and_then(Value::as_str);
                let token = record_field(document, field).and_then(index_token);
                if let (Some(id), Some(token)) = (id, token) {
                    let key = self.index_key(collection, field, &token);
                    pipe.cmd("SADD").arg(&key).arg(id).ignore();
                    pipe.cmd("SADD").arg(&idxkeys_key).arg(&key).ignore();
                }
            }
            let () = pipe.query_async(&mut conn).await?;
            log::debug!("Backfilled index {collection}.{field} over {} documents", existing.len());
        }
        Ok(true)
    }
}
