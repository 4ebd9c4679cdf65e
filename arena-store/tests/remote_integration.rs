//! Remote backend integration tests, driven through the in-memory database.
//!
//! Verifies:
//! - Records come back exactly as written; internal `_id`s stay inside
//! - Cached reads equal backend reads after a commit
//! - Lazy connection: failures propagate, the next call retries
//! - Connect timeout
//! - Partial multi-collection writes are reported exactly and the cache
//!   reflects what was persisted
//! - Indexed lookups, and lookups on values no index can answer
//! - A failed replace leaves the old collection in place

use arena_store::backend::remote::{INTERNAL_ID, WRAPPED_VALUE};
use arena_store::backend::{Backend, Connector, MemoryDatabase};
use arena_store::{
    Collection, DocumentStore, MemoryConnector, RemoteBackend, Repository, StoreError,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn store_over(connector: MemoryConnector, ttl: Duration) -> DocumentStore {
    let backend = RemoteBackend::new(connector, Duration::from_millis(200));
    DocumentStore::with_backend(Arc::new(backend), ttl)
}

/// A connector whose server never answers.
struct Unresponsive;

#[async_trait]
impl Connector for Unresponsive {
    type Database = Arc<MemoryDatabase>;

    async fn connect(&self) -> arena_store::Result<Self::Database> {
        std::future::pending().await
    }

    fn target(&self) -> String {
        "memory://unresponsive".to_string()
    }
}

// ─── Internal Identity ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_records_come_back_as_written() {
    let connector = MemoryConnector::default();
    let store = store_over(connector.clone(), Duration::ZERO);
    let written = vec![
        json!({"id": "f1", "status": "open", "_id": "caller-chosen"}),
        json!({"_value": 5}),
        json!("bare"),
    ];

    let expected = written.clone();
    store
        .mutate_collection(Collection::Fights, |_| Ok::<_, StoreError>(written))
        .await
        .unwrap();

    let raw = connector.database().raw_documents("fights");
    assert_eq!(raw.len(), 3);
    for (document, record) in raw.iter().zip(&expected) {
        assert_ne!(document[INTERNAL_ID], "caller-chosen");
        assert_eq!(&document[WRAPPED_VALUE], record);
    }

    assert_eq!(store.read_collection(Collection::Fights).await.unwrap(), expected);
    let graph = store.read_all().await.unwrap();
    assert_eq!(graph.get(Collection::Fights), expected.as_slice());
}

#[tokio::test]
async fn test_cached_read_equals_backend_read() {
    let store = store_over(MemoryConnector::default(), Duration::from_secs(60));
    store
        .mutate_collection(Collection::Users, |_| {
            Ok::<_, StoreError>(vec![json!({"id": "u1", "_id": "x"}), json!(7)])
        })
        .await
        .unwrap();

    let cached = store.read_collection(Collection::Users).await.unwrap();
    store.invalidate_cache();
    let fetched = store.read_collection(Collection::Users).await.unwrap();
    assert_eq!(cached, fetched);
    assert_eq!(fetched, vec![json!({"id": "u1", "_id": "x"}), json!(7)]);
}

#[tokio::test]
async fn test_rewrite_assigns_fresh_ids() {
    let connector = MemoryConnector::default();
    let store = store_over(connector.clone(), Duration::ZERO);
    let tags = Repository::<Value>::new(&store, Collection::Tags);

    tags.insert(json!({"id": "t1"}), None).await.unwrap();
    let first = connector.database().raw_documents("tags")[0][INTERNAL_ID].clone();
    tags.insert(json!({"id": "t2"}), None).await.unwrap();
    let second = connector.database().raw_documents("tags")[0][INTERNAL_ID].clone();

    assert_ne!(first, second);
    assert_eq!(tags.get_all().await.unwrap().len(), 2);
}

// ─── Connection Lifecycle ────────────────────────────────────────────────────

#[tokio::test]
async fn test_failed_connect_is_retried_on_next_call() {
    let connector = MemoryConnector::default();
    connector.refuse_connections(1);
    let backend = Arc::new(RemoteBackend::new(connector, Duration::from_millis(200)));
    let store = DocumentStore::with_backend(backend.clone(), Duration::ZERO);

    let err = store.read_all().await.unwrap_err();
    assert!(matches!(err, StoreError::Connection { .. }));
    assert!(!backend.is_connected());

    store.read_all().await.unwrap();
    assert!(backend.is_connected());
    store.read_all().await.unwrap();
    assert_eq!(backend.stats().connects, 2);
}

#[tokio::test]
async fn test_indexes_are_created_once() {
    let connector = MemoryConnector::default();
    let store = store_over(connector.clone(), Duration::ZERO);
    store.read_all().await.unwrap();

    let database = connector.database();
    for collection in Collection::ALL {
        let mut expected: Vec<String> = collection
            .indexed_fields()
            .iter()
            .map(|f| f.to_string())
            .collect();
        expected.sort();
        assert_eq!(database.indexed_fields(collection.as_str()), expected);
    }

    // A second store over the same database finds the indexes in place.
    let again = store_over(connector.clone(), Duration::ZERO);
    again.read_all().await.unwrap();
    assert_eq!(database.indexed_fields("users").len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout() {
    let backend = RemoteBackend::new(Unresponsive, Duration::from_millis(50));
    let err = backend.read_collection(Collection::Users).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::Timeout { timeout, .. } if timeout == Duration::from_millis(50)
    ));
    assert!(!backend.is_connected());
}

// ─── Partial Writes ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_partial_write_is_reported_and_cache_repaired() {
    let connector = MemoryConnector::default();
    let store = store_over(connector.clone(), Duration::from_secs(60));
    store
        .mutate_collection(Collection::Bets, |_| {
            Ok::<_, StoreError>(vec![json!({"id": "b0", "fightId": "f0"})])
        })
        .await
        .unwrap();

    connector.database().fail_next_write("bets");
    let err = store
        .mutate_all(|mut graph| async move {
            graph.get_mut(Collection::Fights).push(json!({"id": "f1", "status": "open"}));
            graph.get_mut(Collection::Bets).push(json!({"id": "b1", "fightId": "f1"}));
            Ok::<_, StoreError>(graph)
        })
        .await
        .unwrap_err();

    match err {
        StoreError::PartialWrite { committed, failed } => {
            assert_eq!(committed, vec![Collection::Fights]);
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].0, Collection::Bets);
        }
        other => panic!("expected a partial write, got {other}"),
    }

    // Fights committed and stays cached; bets is re-read from the database.
    let reads = store.stats().backend.reads;
    assert_eq!(store.read_collection(Collection::Fights).await.unwrap().len(), 1);
    assert_eq!(store.stats().backend.reads, reads);

    let bets = store.read_collection(Collection::Bets).await.unwrap();
    assert_eq!(bets, vec![json!({"id": "b0", "fightId": "f0"})]);
    assert_eq!(store.stats().backend.reads, reads + 1);
    assert_eq!(store.stats().queue.failed, 1);
}

// ─── Indexed Lookups ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_find_by_id_through_index() {
    let connector = MemoryConnector::default();
    let store = store_over(connector.clone(), Duration::ZERO);
    let votes = Repository::<Value>::new(&store, Collection::Votes);
    votes
        .replace_all(
            (0..20)
                .map(|i| json!({"id": format!("v{i}"), "postId": format!("p{}", i % 4), "userId": "u1"}))
                .collect(),
            None,
        )
        .await
        .unwrap();

    let found = votes.find_by_id("v7").await.unwrap().unwrap();
    assert_eq!(found["postId"], "p3");
    assert_eq!(votes.find_by_field("postId", "p0").await.unwrap().len(), 5);
    assert_eq!(connector.database().stats().indexed_finds, 2);
}

#[tokio::test]
async fn test_find_by_agrees_with_cache_for_untokenized_values() {
    let connector = MemoryConnector::default();
    let warm = store_over(connector.clone(), Duration::from_secs(60));
    let records = vec![
        json!({"id": "u1", "email": null}),
        json!({"id": "u2", "email": "bea@arena.io", "roles": ["admin"]}),
    ];
    warm.mutate_collection(Collection::Users, |_| Ok::<_, StoreError>(records))
        .await
        .unwrap();
    let cold = store_over(connector.clone(), Duration::ZERO);

    for (field, value) in [
        ("email", Value::Null),
        ("roles", json!(["admin"])),
        ("email", json!("bea@arena.io")),
    ] {
        let from_cache = warm.find_by(Collection::Users, field, &value).await.unwrap();
        let from_backend = cold.find_by(Collection::Users, field, &value).await.unwrap();
        assert_eq!(from_cache.len(), 1, "{field} = {value}");
        assert_eq!(from_cache, from_backend, "{field} = {value}");
    }
}

// ─── Replace Atomicity ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_failed_insert_keeps_old_collection() {
    let connector = MemoryConnector::default();
    let store = store_over(connector.clone(), Duration::from_secs(60));
    store
        .mutate_collection(Collection::Tags, |_| Ok::<_, StoreError>(vec![json!({"id": "t1"})]))
        .await
        .unwrap();

    connector.database().fail_next_insert("tags");
    let err = store
        .mutate_collection(Collection::Tags, |mut tags| {
            tags.push(json!({"id": "t2"}));
            Ok::<_, StoreError>(tags)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Database(_)));

    assert_eq!(
        store.read_collection(Collection::Tags).await.unwrap(),
        vec![json!({"id": "t1"})]
    );
    store.invalidate_cache();
    assert_eq!(
        store.read_collection(Collection::Tags).await.unwrap(),
        vec![json!({"id": "t1"})]
    );
}
