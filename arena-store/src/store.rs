//! The document store: four primitives and the unit of work.
//!
//! ```text
//!  read_all / read_collection ──► cache ──(miss)──► backend ──► fill cache
//!
//!  mutate_all / mutate_collection / begin
//!     │
//!     ▼
//!  MutationQueue slot ──► current state (cache, else backend)
//!                     ──► caller transform
//!                     ──► commit changed collections ──► cache
//! ```
//!
//! Reads are never serialized and may observe the state before or after a
//! concurrent mutation, but never a mix of both.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::backend::{Backend, BackendStats, LocalFileBackend, RedisConnector, RemoteBackend};
use crate::cache::{CacheStats, SnapshotCache};
use crate::config::{BackendKind, StoreConfig};
use crate::error::{Result, StoreError};
use crate::queue::{MutationQueue, QueueSlot, QueueStats};
use crate::schema::{Collection, Graph};

/// Snapshot of every store counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub backend_kind: BackendKind,
    pub cache: CacheStats,
    pub backend: BackendStats,
    pub queue: QueueStats,
}

/// An embedded document store over one backend.
///
/// Share it between tasks with `Arc<DocumentStore>`. Mutations submitted
/// through one instance are applied one at a time in submission order.
pub struct DocumentStore {
    backend: Arc<dyn Backend>,
    cache: SnapshotCache,
    queue: MutationQueue,
}

impl DocumentStore {
    /// Build the backend named by `config`. No I/O happens until first use.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let backend: Arc<dyn Backend> = match config.backend {
            BackendKind::Local => Arc::new(LocalFileBackend::new(&config.data_path)),
            BackendKind::Remote => {
                let connector = RedisConnector::new(&config.remote_url, config.namespace.clone())?;
                Arc::new(RemoteBackend::new(connector, config.connect_timeout))
            }
        };
        log::info!(
            "Opened {} store (cache ttl {:?})",
            config.backend,
            config.cache_ttl
        );
        Ok(Self::with_backend(backend, config.cache_ttl))
    }

    /// Local store at `path` with the given cache TTL.
    pub fn local(path: impl AsRef<Path>, cache_ttl: Duration) -> Self {
        Self::with_backend(Arc::new(LocalFileBackend::new(path.as_ref())), cache_ttl)
    }

    pub fn with_backend(backend: Arc<dyn Backend>, cache_ttl: Duration) -> Self {
        Self {
            backend,
            cache: SnapshotCache::new(cache_ttl),
            queue: MutationQueue::new(),
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// The whole graph: a fresh cached snapshot, else a backend read.
    pub async fn read_all(&self) -> Result<Graph> {
        if let Some(graph) = self.cache.get() {
            log::trace!("read_all served from cache");
            return Ok(graph);
        }
        let epoch = self.cache.epoch();
        let graph = self.backend.read_all().await?;
        self.cache.fill(&graph, epoch);
        Ok(graph)
    }

    /// One collection: a fresh cached snapshot, else a backend read.
    pub async fn read_collection(&self, collection: Collection) -> Result<Vec<Value>> {
        if let Some(records) = self.cache.get_collection(collection) {
            log::trace!("read_collection({collection}) served from cache");
            return Ok(records);
        }
        let epoch = self.cache.epoch();
        let records = self.backend.read_collection(collection).await?;
        self.cache.fill_collection(collection, &records, epoch);
        Ok(records)
    }

    /// Records of `collection` whose `field` equals `value`.
    ///
    /// Served from the cache when fresh. Otherwise the backend answers, using
    /// its secondary index where it has one; the result is not cached.
    pub async fn find_by(&self, collection: Collection, field: &str, value: &Value) -> Result<Vec<Value>> {
        if let Some(records) = self.cache.get_collection(collection) {
            return Ok(records
                .into_iter()
                .filter(|r| r.get(field) == Some(value))
                .collect());
        }
        self.backend.find_by(collection, field, value).await
    }

    /// Apply `transform` to the whole graph and persist the result.
    ///
    /// Only collections that differ from the current state are written. If
    /// `transform` fails nothing is written and its error is returned as is.
    pub async fn mutate_all<F, Fut, E>(&self, transform: F) -> std::result::Result<Graph, E>
    where
        F: FnOnce(Graph) -> Fut,
        Fut: Future<Output = std::result::Result<Graph, E>>,
        E: From<StoreError>,
    {
        self.queue
            .run(|| async move {
                let base = self.current_graph().await?;
                let next = transform(base.clone()).await?;
                self.commit_graph(&base, &next).await?;
                Ok::<_, E>(next)
            })
            .await
    }

    /// Apply `transform` to one collection and persist the result.
    pub async fn mutate_collection<F, E>(
        &self,
        collection: Collection,
        transform: F,
    ) -> std::result::Result<Vec<Value>, E>
    where
        F: FnOnce(Vec<Value>) -> std::result::Result<Vec<Value>, E>,
        E: From<StoreError>,
    {
        self.mutate_records(collection, |records| {
            *records = transform(std::mem::take(records))?;
            Ok::<_, E>(())
        })
        .await
        .map(|(records, ())| records)
    }

    /// Edit one collection in place, returning the persisted records and
    /// whatever `edit` produced.
    pub(crate) async fn mutate_records<F, R, E>(
        &self,
        collection: Collection,
        edit: F,
    ) -> std::result::Result<(Vec<Value>, R), E>
    where
        F: FnOnce(&mut Vec<Value>) -> std::result::Result<R, E>,
        E: From<StoreError>,
    {
        self.queue
            .run(|| async move {
                let base = self.current_collection(collection).await?;
                let mut next = base.clone();
                let output = edit(&mut next)?;
                self.commit_collection(collection, &base, &next).await?;
                Ok::<_, E>((next, output))
            })
            .await
    }

    /// Take the mutation slot and load a working copy of the graph.
    ///
    /// The unit holds the slot until it is committed, rolled back or dropped,
    /// so every other mutation on this store waits for it. Do not call the
    /// mutation primitives of the same store while holding one.
    pub async fn begin(&self) -> Result<UnitOfWork<'_>> {
        let slot = self.queue.acquire().await;
        let base = self.current_graph().await?;
        log::trace!("Unit of work started");
        Ok(UnitOfWork {
            store: self,
            working: base.clone(),
            base,
            slot,
        })
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            backend_kind: self.backend.kind(),
            cache: self.cache.stats(),
            backend: self.backend.stats(),
            queue: self.queue.stats(),
        }
    }

    /// Forget every cached snapshot; the next read goes to the backend.
    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }

    async fn current_graph(&self) -> Result<Graph> {
        if let Some(graph) = self.cache.get() {
            return Ok(graph);
        }
        let graph = self.backend.read_all().await?;
        self.cache.set(&graph);
        Ok(graph)
    }

    async fn current_collection(&self, collection: Collection) -> Result<Vec<Value>> {
        if let Some(records) = self.cache.get_collection(collection) {
            return Ok(records);
        }
        let records = self.backend.read_collection(collection).await?;
        self.cache.set_collection(collection, &records);
        Ok(records)
    }

    async fn commit_graph(&self, base: &Graph, next: &Graph) -> Result<()> {
        let changed = base.changed_collections(next);
        if changed.is_empty() {
            log::trace!("Mutation changed nothing, skipping write");
            return Ok(());
        }
        for &collection in &changed {
            self.cache.invalidate_collection(collection);
        }

        match self.backend.write_all(next, &changed).await {
            Ok(()) => {
                self.cache.set(next);
                log::debug!("Committed {} collection(s): {changed:?}", changed.len());
                Ok(())
            }
            Err(StoreError::PartialWrite { committed, failed }) => {
                log::warn!("Partial write: committed {committed:?}, failed {failed:?}");
                for &collection in &committed {
                    self.cache.set_collection(collection, next.get(collection));
                }
                Err(StoreError::PartialWrite { committed, failed })
            }
            Err(e) => {
                log::error!("Commit of {changed:?} failed: {e}");
                Err(e)
            }
        }
    }

    async fn commit_collection(&self, collection: Collection, base: &[Value], next: &[Value]) -> Result<()> {
        if base == next {
            log::trace!("Mutation left {collection} unchanged, skipping write");
            return Ok(());
        }
        self.cache.invalidate_collection(collection);
        if let Err(e) = self.backend.replace_collection(collection, next).await {
            log::error!("Commit of {collection} failed: {e}");
            return Err(e);
        }
        self.cache.set_collection(collection, next);
        log::debug!("Committed {collection} ({} records)", next.len());
        Ok(())
    }
}

/// A batch of collection edits committed together.
///
/// Obtained from [`DocumentStore::begin`]. Edits apply to an in-memory copy
/// of the graph; nothing reaches the backend until [`commit`](Self::commit).
/// Dropping the unit discards the edits and releases the mutation slot.
pub struct UnitOfWork<'s> {
    store: &'s DocumentStore,
    base: Graph,
    working: Graph,
    slot: QueueSlot<'s>,
}

impl UnitOfWork<'_> {
    /// The working graph, edits included.
    pub fn graph(&self) -> &Graph {
        &self.working
    }

    pub fn collection(&self, collection: Collection) -> &[Value] {
        self.working.get(collection)
    }

    pub fn collection_mut(&mut self, collection: Collection) -> &mut Vec<Value> {
        self.working.get_mut(collection)
    }

    /// Whether any collection differs from the state loaded at `begin`.
    pub fn is_dirty(&self) -> bool {
        self.base != self.working
    }

    /// Write every changed collection and release the slot.
    pub async fn commit(self) -> Result<Graph> {
        let UnitOfWork {
            store,
            base,
            working,
            slot,
        } = self;
        let result = store.commit_graph(&base, &working).await;
        slot.finish(result.is_ok());
        result.map(|()| working)
    }

    /// Discard every edit and release the slot.
    pub fn rollback(self) {
        log::debug!("Unit of work rolled back");
        self.slot.finish(true);
    }
}
