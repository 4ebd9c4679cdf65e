//! Time-boxed snapshot cache in front of the backends.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                SnapshotCache                  │
//! │                                               │
//! │  graph:       (Graph, stored_at)              │
//! │  collections: users → (records, stored_at)    │
//! │               posts → (records, stored_at)    │
//! │               ...                             │
//! │                                               │
//! │  fresh ⇔ now - stored_at < ttl                │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! The two views never disagree: `set` refreshes both together and
//! `set_collection` patches the cached graph in place. A `ttl` of zero turns
//! the cache off so every read reaches the backend.
//!
//! Writers (`set*`, `invalidate_collection`, `clear`) bump an epoch. Readers
//! take the epoch before going to the backend and hand it to `fill*`, which
//! drops the snapshot if a writer got there first. A read that raced a commit
//! therefore never puts the pre-commit state back.
//!
//! Time comes from `tokio::time::Instant`, so tests can pause and advance it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::time::Instant;

use crate::schema::{Collection, Graph};

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    stored_at: Instant,
}

impl<T> CacheEntry<T> {
    fn new(value: T, stored_at: Instant) -> Self {
        Self { value, stored_at }
    }

    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.stored_at) < ttl
    }
}

#[derive(Debug, Default)]
struct CacheState {
    epoch: u64,
    graph: Option<CacheEntry<Graph>>,
    collections: HashMap<Collection, CacheEntry<Vec<Value>>>,
}

impl CacheState {
    fn store_graph(&mut self, graph: &Graph, now: Instant) {
        self.collections = graph
            .iter()
            .map(|(c, records)| (c, CacheEntry::new(records.to_vec(), now)))
            .collect();
        self.graph = Some(CacheEntry::new(graph.clone(), now));
    }

    fn store_collection(&mut self, collection: Collection, records: &[Value], now: Instant, ttl: Duration) {
        self.collections
            .insert(collection, CacheEntry::new(records.to_vec(), now));
        let graph_fresh = self.graph.as_ref().is_some_and(|e| e.is_fresh(now, ttl));
        if graph_fresh {
            if let Some(entry) = self.graph.as_mut() {
                entry.value.set(collection, records.to_vec());
            }
        } else {
            self.graph = None;
        }
    }
}

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// In-process TTL cache for the whole graph and individual collections.
pub struct SnapshotCache {
    ttl: Duration,
    state: RwLock<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SnapshotCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether the cache holds anything at all (`ttl > 0`).
    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// The whole graph, if a fresh snapshot is held.
    pub fn get(&self) -> Option<Graph> {
        let found = {
            let state = self.state.read();
            state
                .graph
                .as_ref()
                .filter(|e| e.is_fresh(Instant::now(), self.ttl))
                .map(|e| e.value.clone())
        };
        self.record(found.is_some());
        found
    }

    /// One collection, if a fresh snapshot is held.
    pub fn get_collection(&self, collection: Collection) -> Option<Vec<Value>> {
        let found = {
            let state = self.state.read();
            let now = Instant::now();
            match state.collections.get(&collection) {
                Some(entry) if entry.is_fresh(now, self.ttl) => Some(entry.value.clone()),
                _ => state
                    .graph
                    .as_ref()
                    .filter(|e| e.is_fresh(now, self.ttl))
                    .map(|e| e.value.get(collection).to_vec()),
            }
        };
        self.record(found.is_some());
        found
    }

    /// Current write epoch. Pass it to [`fill`](Self::fill) after a backend read.
    pub fn epoch(&self) -> u64 {
        self.state.read().epoch
    }

    /// Store a whole-graph snapshot written by a mutation.
    pub fn set(&self, graph: &Graph) {
        let mut state = self.state.write();
        state.epoch += 1;
        if self.is_enabled() {
            state.store_graph(graph, Instant::now());
            log::trace!("Cache refreshed with full graph ({} records)", graph.record_count());
        }
    }

    /// Store one collection written by a mutation. A fresh cached graph is
    /// patched to match; a stale one is dropped.
    pub fn set_collection(&self, collection: Collection, records: &[Value]) {
        let mut state = self.state.write();
        state.epoch += 1;
        if self.is_enabled() {
            state.store_collection(collection, records, Instant::now(), self.ttl);
        }
    }

    /// Store a graph read from the backend, unless a writer has touched the
    /// cache since `epoch`. Returns whether the snapshot was kept.
    pub fn fill(&self, graph: &Graph, epoch: u64) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let mut state = self.state.write();
        if state.epoch != epoch {
            log::trace!("Discarding graph read from epoch {epoch}, cache is at {}", state.epoch);
            return false;
        }
        state.store_graph(graph, Instant::now());
        true
    }

    /// Store one collection read from the backend, unless a writer has
    /// touched the cache since `epoch`.
    pub fn fill_collection(&self, collection: Collection, records: &[Value], epoch: u64) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let mut state = self.state.write();
        if state.epoch != epoch {
            return false;
        }
        state.store_collection(collection, records, Instant::now(), self.ttl);
        true
    }

    /// Drop one collection and the whole-graph snapshot that contains it.
    pub fn invalidate_collection(&self, collection: Collection) {
        let mut state = self.state.write();
        state.epoch += 1;
        state.collections.remove(&collection);
        state.graph = None;
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.epoch += 1;
        state.collections.clear();
        state.graph = None;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph_with_user(name: &str) -> Graph {
        let mut graph = Graph::empty();
        graph.set(Collection::Users, vec![json!({"id": "u1", "name": name})]);
        graph
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_miss_then_hit() {
        let cache = SnapshotCache::new(Duration::from_millis(100));
        assert!(cache.get().is_none());

        cache.set(&graph_with_user("Ann"));
        assert_eq!(cache.get(), Some(graph_with_user("Ann")));
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_at_ttl() {
        let cache = SnapshotCache::new(Duration::from_millis(100));
        cache.set(&graph_with_user("Ann"));

        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(cache.get().is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get().is_none(), "now - stored_at == ttl is a miss");
        assert!(cache.get_collection(Collection::Users).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_disables_cache() {
        let cache = SnapshotCache::new(Duration::ZERO);
        assert!(!cache.is_enabled());
        cache.set(&graph_with_user("Ann"));
        cache.set_collection(Collection::Posts, &[json!({"id": "p1"})]);
        assert!(cache.get().is_none());
        assert!(cache.get_collection(Collection::Posts).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_refreshes_collection_views() {
        let cache = SnapshotCache::new(Duration::from_secs(1));
        cache.set(&graph_with_user("Ann"));
        assert_eq!(
            cache.get_collection(Collection::Users).unwrap(),
            vec![json!({"id": "u1", "name": "Ann"})]
        );
        assert_eq!(cache.get_collection(Collection::Bets).unwrap(), Vec::<Value>::new());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_collection_patches_graph() {
        let cache = SnapshotCache::new(Duration::from_secs(1));
        cache.set(&graph_with_user("Ann"));
        cache.set_collection(Collection::Users, &[json!({"id": "u1", "name": "Bea"})]);

        assert_eq!(cache.get().unwrap(), graph_with_user("Bea"));
        assert_eq!(
            cache.get_collection(Collection::Users).unwrap(),
            vec![json!({"id": "u1", "name": "Bea"})]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_collection_drops_stale_graph() {
        let cache = SnapshotCache::new(Duration::from_millis(100));
        cache.set(&graph_with_user("Ann"));
        tokio::time::advance(Duration::from_millis(150)).await;

        cache.set_collection(Collection::Posts, &[json!({"id": "p1"})]);
        assert!(cache.get().is_none());
        assert!(cache.get_collection(Collection::Posts).is_some());
        assert!(cache.get_collection(Collection::Users).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_collection() {
        let cache = SnapshotCache::new(Duration::from_secs(1));
        cache.set(&graph_with_user("Ann"));
        cache.invalidate_collection(Collection::Users);

        assert!(cache.get().is_none());
        assert!(cache.get_collection(Collection::Users).is_none());
        assert!(cache.get_collection(Collection::Posts).is_some());

        cache.clear();
        assert!(cache.get_collection(Collection::Posts).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_discards_read_that_raced_a_write() {
        let cache = SnapshotCache::new(Duration::from_secs(1));
        let epoch = cache.epoch();

        // A mutation commits while the reader is still at the backend.
        cache.set(&graph_with_user("Bea"));

        assert!(!cache.fill(&graph_with_user("Ann"), epoch));
        assert_eq!(cache.get(), Some(graph_with_user("Bea")));

        let epoch = cache.epoch();
        assert!(cache.fill_collection(Collection::Posts, &[json!({"id": "p1"})], epoch));
        assert_eq!(cache.get().unwrap().get(Collection::Posts), &[json!({"id": "p1"})]);
    }
}
