//! Persistence backends.
//!
//! Architecture:
//! ```text
//!                    ┌──────────────────┐
//!                    │  dyn Backend     │
//!                    └────────┬─────────┘
//!              ┌──────────────┴───────────────┐
//!              ▼                              ▼
//!   ┌────────────────────┐        ┌──────────────────────────┐
//!   │ LocalFileBackend   │        │ RemoteBackend<Connector> │
//!   │ whole graph, one   │        │ one collection per graph │
//!   │ JSON file          │        │ key, lazy connection     │
//!   └────────────────────┘        └────────────┬─────────────┘
//!                                   ┌──────────┴──────────┐
//!                                   ▼                     ▼
//!                          RedisConnector         MemoryConnector
//!                          (deployment)           (tests, embedding)
//! ```
//!
//! Both backends return materialized snapshots, never live views, and rely
//! on the mutation queue for write exclusivity.

pub mod local;
pub mod memory;
pub mod redis_db;
pub mod remote;

pub use local::LocalFileBackend;
pub use memory::{MemoryConnector, MemoryDatabase};
pub use redis_db::{RedisConnector, RedisDatabase};
pub use remote::{Connector, Document, DocumentDatabase, RemoteBackend};

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use crate::config::BackendKind;
use crate::error::Result;
use crate::schema::{Collection, Graph};

/// Backend counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Read operations served from the medium
    pub reads: u64,
    /// Write operations issued to the medium
    pub writes: u64,
    /// Connection attempts (remote only)
    pub connects: u64,
}

/// Lock-free backend counters, read via [`AtomicBackendStats::snapshot`].
#[derive(Debug, Default)]
pub(crate) struct AtomicBackendStats {
    reads: AtomicU64,
    writes: AtomicU64,
    connects: AtomicU64,
}

impl AtomicBackendStats {
    pub(crate) fn read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> BackendStats {
        BackendStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
        }
    }
}

/// The storage medium beneath the cache and the queue.
///
/// Implementations do no locking of their own: callers must not issue two
/// writes concurrently. [`DocumentStore`](crate::DocumentStore) guarantees
/// this through its mutation queue.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// The whole normalized graph.
    async fn read_all(&self) -> Result<Graph>;

    async fn read_collection(&self, collection: Collection) -> Result<Vec<Value>>;

    /// Persist `graph`. `changed` names the collections that differ from the
    /// last persisted state; backends that write per collection only touch those.
    async fn write_all(&self, graph: &Graph, changed: &[Collection]) -> Result<()>;

    /// Replace one collection's records wholesale.
    async fn replace_collection(&self, collection: Collection, records: &[Value]) -> Result<()>;

    /// Records whose `field` equals `value`.
    async fn find_by(&self, collection: Collection, field: &str, value: &Value) -> Result<Vec<Value>> {
        let records = self.read_collection(collection).await?;
        Ok(records
            .into_iter()
            .filter(|r| r.get(field) == Some(value))
            .collect())
    }

    fn stats(&self) -> BackendStats;
}
