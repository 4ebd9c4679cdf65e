//! # arena-store: Embedded document store for the arena app
//!
//! Keeps the app's document graph (users, posts, fights, bets, ...) in one
//! JSON file or in a networked document database, behind a TTL cache and a
//! FIFO mutation queue so concurrent requests never lose updates.
//!
//! ## Architecture
//!
//! ```text
//!  feature code
//!       │
//!       ▼
//! ┌─────────────┐   mutate    ┌───────────────┐
//! │ Repository  │ ──────────► │ MutationQueue │  one task at a time, FIFO
//! │ (typed)     │             └───────┬───────┘
//! └──────┬──────┘                     │
//!        │ read                       ▼
//!        ▼                    ┌───────────────┐
//! ┌─────────────┐  fresh?     │ DocumentStore │
//! │SnapshotCache│ ◄─────────► │ commit path   │
//! └─────────────┘             └───────┬───────┘
//!                                     │
//!                       ┌─────────────┴─────────────┐
//!                       ▼                           ▼
//!               ┌──────────────┐          ┌──────────────────┐
//!               │ LocalFile    │          │ Remote (Redis /  │
//!               │ db.json      │          │ in-memory)       │
//!               └──────────────┘          └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`schema`]: collections, the graph, normalization
//! - [`backend`]: local file and remote document backends
//! - [`cache`]: TTL snapshot cache
//! - [`queue`]: write serializer
//! - [`store`]: the four primitives and units of work
//! - [`repository`]: typed CRUD per collection
//! - [`config`]: `ARENA_*` configuration

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod queue;
pub mod repository;
pub mod schema;
pub mod store;

// Re-exports for convenience
pub use backend::{
    Backend, BackendStats, Connector, DocumentDatabase, LocalFileBackend, MemoryConnector,
    MemoryDatabase, RedisConnector, RemoteBackend,
};
pub use cache::{CacheStats, SnapshotCache};
pub use config::{BackendKind, StoreConfig};
pub use error::{Result, StoreError};
pub use queue::{MutationQueue, QueueStats};
pub use repository::Repository;
pub use schema::{normalize, Collection, Graph};
pub use store::{DocumentStore, StoreStats, UnitOfWork};
