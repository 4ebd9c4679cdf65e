//! Typed CRUD over one collection.
//!
//! A [`Repository`] pairs a [`Collection`] with a record type and an id
//! field. Reads are served through the store's cache. Every mutation takes an
//! optional [`UnitOfWork`]: with one, the edit lands in the unit's working
//! graph and is committed by whoever owns the unit; without one, the edit is
//! its own queued mutation.
//!
//! Records are open-ended: a `T` may model only some fields. Updates write
//! the re-encoded `T` over the stored record, so fields `T` does not model
//! are kept.

use std::collections::HashMap;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::schema::Collection;
use crate::store::{DocumentStore, UnitOfWork};

/// Default identifier field.
pub const DEFAULT_ID_FIELD: &str = "id";

/// Typed access to one collection of a [`DocumentStore`].
pub struct Repository<'s, T> {
    store: &'s DocumentStore,
    collection: Collection,
    id_field: String,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for Repository<'_, T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store,
            collection: self.collection,
            id_field: self.id_field.clone(),
            _record: PhantomData,
        }
    }
}

impl<'s, T> Repository<'s, T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(store: &'s DocumentStore, collection: Collection) -> Self {
        Self {
            store,
            collection,
            id_field: DEFAULT_ID_FIELD.to_string(),
            _record: PhantomData,
        }
    }

    /// Use `field` instead of `"id"` to identify records.
    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    // ─── Reads ──────────────────────────────────────────────────────────

    /// Every record, as an owned copy.
    pub async fn get_all(&self) -> Result<Vec<T>> {
        let records = self.store.read_collection(self.collection).await?;
        records.into_iter().map(decode).collect()
    }

    pub async fn find_one(&self, predicate: impl Fn(&T) -> bool) -> Result<Option<T>> {
        Ok(self.get_all().await?.into_iter().find(|r| predicate(r)))
    }

    pub async fn find_by_id(&self, id: impl Into<Value>) -> Result<Option<T>> {
        let id = id.into();
        let found = self
            .store
            .find_by(self.collection, &self.id_field, &id)
            .await?;
        found.into_iter().next().map(decode).transpose()
    }

    /// Records whose `field` equals `value`. Indexed fields are answered by
    /// the remote backend's index when the cache is cold.
    pub async fn find_by_field(&self, field: &str, value: impl Into<Value>) -> Result<Vec<T>> {
        let records = self
            .store
            .find_by(self.collection, field, &value.into())
            .await?;
        records.into_iter().map(decode).collect()
    }

    pub async fn filter(&self, predicate: impl Fn(&T) -> bool) -> Result<Vec<T>> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .filter(|r| predicate(r))
            .collect())
    }

    // ─── Mutations ──────────────────────────────────────────────────────

    /// Append `record`.
    pub async fn insert(&self, record: T, tx: Option<&mut UnitOfWork<'_>>) -> Result<T> {
        let value = encode(&record)?;
        self.apply(tx, move |records| {
            records.push(value);
            Ok::<_, StoreError>(())
        })
        .await?;
        Ok(record)
    }

    /// Replace every record of the collection.
    pub async fn replace_all(&self, records: Vec<T>, tx: Option<&mut UnitOfWork<'_>>) -> Result<Vec<T>> {
        let values = records.iter().map(encode).collect::<Result<Vec<_>>>()?;
        self.apply(tx, move |current| {
            *current = values;
            Ok::<_, StoreError>(())
        })
        .await?;
        Ok(records)
    }

    /// Rewrite the whole collection with `transform`.
    ///
    /// Each returned record is written over the stored record with the same
    /// id, if any. An error from `transform` aborts the mutation and is
    /// returned as is.
    pub async fn update_all<F, E>(&self, transform: F, tx: Option<&mut UnitOfWork<'_>>) -> std::result::Result<Vec<T>, E>
    where
        F: FnOnce(Vec<T>) -> std::result::Result<Vec<T>, E>,
        E: From<StoreError>,
    {
        let id_field = self.id_field.as_str();
        self.apply(tx, move |current| {
            let originals = std::mem::take(current);
            let typed = originals
                .iter()
                .cloned()
                .map(decode)
                .collect::<Result<Vec<T>>>()?;
            let next = transform(typed)?;

            let mut by_id: HashMap<String, Value> = HashMap::new();
            for original in originals {
                if let Some(key) = original.get(id_field).map(Value::to_string) {
                    by_id.entry(key).or_insert(original);
                }
            }
            *current = next
                .iter()
                .map(|record| {
                    let encoded = encode(record)?;
                    let original = encoded
                        .get(id_field)
                        .and_then(|id| by_id.remove(&id.to_string()));
                    Ok(match original {
                        Some(original) => overlay(original, encoded),
                        None => encoded,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(next)
        })
        .await
    }

    /// Replace the first record with id `id` by `updater(record)`, leaving
    /// every other record untouched. `None` if there is no such record.
    pub async fn update_by_id<F>(
        &self,
        id: impl Into<Value>,
        updater: F,
        tx: Option<&mut UnitOfWork<'_>>,
    ) -> Result<Option<T>>
    where
        F: FnOnce(T) -> T,
    {
        let id = id.into();
        let id_field = self.id_field.as_str();
        self.apply(tx, move |records| {
            let Some(slot) = records.iter_mut().find(|r| r.get(id_field) == Some(&id)) else {
                return Ok(None);
            };
            let updated = updater(decode(slot.clone())?);
            *slot = overlay(slot.take(), encode(&updated)?);
            Ok::<_, StoreError>(Some(updated))
        })
        .await
    }

    /// Remove the first record with id `id` and return it.
    pub async fn remove_by_id(&self, id: impl Into<Value>, tx: Option<&mut UnitOfWork<'_>>) -> Result<Option<T>> {
        let id = id.into();
        let id_field = self.id_field.as_str();
        self.apply(tx, move |records| {
            match records.iter().position(|r| r.get(id_field) == Some(&id)) {
                Some(index) => decode(records.remove(index)).map(Some),
                None => Ok(None),
            }
        })
        .await
    }

    /// Run `edit` against the unit's working copy, or as a queued mutation.
    ///
    /// In a unit of work the edit runs on a scratch copy, so a failing edit
    /// leaves the working graph as it was.
    async fn apply<F, R, E>(&self, tx: Option<&mut UnitOfWork<'_>>, edit: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&mut Vec<Value>) -> std::result::Result<R, E>,
        E: From<StoreError>,
    {
        match tx {
            Some(tx) => {
                let records = tx.collection_mut(self.collection);
                let mut scratch = records.clone();
                let output = edit(&mut scratch)?;
                *records = scratch;
                Ok(output)
            }
            None => self
                .store
                .mutate_records(self.collection, edit)
                .await
                .map(|(_, output)| output),
        }
    }
}

fn decode<T: DeserializeOwned>(record: Value) -> Result<T> {
    Ok(serde_json::from_value(record)?)
}

fn encode<T: Serialize>(record: &T) -> Result<Value> {
    Ok(serde_json::to_value(record)?)
}

/// `encoded` written over `stored`: fields of `stored` that `encoded` lacks
/// survive. Non-object records are replaced outright.
fn overlay(stored: Value, encoded: Value) -> Value {
    match (stored, encoded) {
        (Value::Object(mut merged), Value::Object(fields)) => {
            merged.extend(fields);
            Value::Object(merged)
        }
        (_, encoded) => encoded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Tag {
        id: String,
        name: String,
        #[serde(default)]
        uses: u32,
    }

    fn tag(id: &str, name: &str) -> Tag {
        Tag {
            id: id.to_string(),
            name: name.to_string(),
            uses: 0,
        }
    }

    fn store() -> (DocumentStore, TempDir) {
        let dir = tempdir().unwrap();
        let store = DocumentStore::local(dir.path().join("db.json"), Duration::from_secs(60));
        (store, dir)
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let (store, _dir) = store();
        let tags = Repository::<Tag>::new(&store, Collection::Tags);

        tags.insert(tag("t1", "boxing"), None).await.unwrap();
        tags.insert(tag("t2", "judo"), None).await.unwrap();

        assert_eq!(tags.get_all().await.unwrap().len(), 2);
        assert_eq!(tags.find_by_id("t2").await.unwrap(), Some(tag("t2", "judo")));
        assert_eq!(tags.find_by_id("t9").await.unwrap(), None);
        assert_eq!(
            tags.find_one(|t| t.name.starts_with('b')).await.unwrap(),
            Some(tag("t1", "boxing"))
        );
        assert_eq!(tags.filter(|t| t.uses == 0).await.unwrap().len(), 2);
        assert_eq!(tags.find_by_field("name", "judo").await.unwrap(), vec![tag("t2", "judo")]);
    }

    #[tokio::test]
    async fn test_update_and_remove_by_id() {
        let (store, _dir) = store();
        let tags = Repository::<Tag>::new(&store, Collection::Tags);
        tags.replace_all(vec![tag("t1", "boxing"), tag("t2", "judo")], None)
            .await
            .unwrap();

        let bump = |mut t: Tag| {
            t.uses += 1;
            t
        };
        let updated = tags.update_by_id("t1", bump, None).await.unwrap();
        assert_eq!(updated.map(|t| t.uses), Some(1));

        let missing = tags.update_by_id("t9", |t| t, None).await.unwrap();
        assert!(missing.is_none());

        assert_eq!(tags.remove_by_id("t2", None).await.unwrap(), Some(tag("t2", "judo")));
        assert_eq!(tags.remove_by_id("t2", None).await.unwrap(), None);
        assert_eq!(tags.get_all().await.unwrap().len(), 1);
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Slim {
        id: String,
        uses: u32,
    }

    #[tokio::test]
    async fn test_updates_keep_unmodeled_fields() {
        let (store, _dir) = store();
        let raw = Repository::<Value>::new(&store, Collection::Tags);
        raw.replace_all(
            vec![
                serde_json::json!({"id": "t1", "uses": 1, "name": "boxing"}),
                serde_json::json!({"id": "t2", "uses": 5, "name": "judo"}),
            ],
            None,
        )
        .await
        .unwrap();
        let slim = Repository::<Slim>::new(&store, Collection::Tags);

        slim.update_by_id(
            "t1",
            |mut t| {
                t.uses += 1;
                t
            },
            None,
        )
        .await
        .unwrap();
        slim.update_all(
            |all| {
                Ok::<_, StoreError>(
                    all.into_iter()
                        .rev()
                        .map(|mut t| {
                            t.uses *= 10;
                            t
                        })
                        .chain([Slim {
                            id: "t3".to_string(),
                            uses: 0,
                        }])
                        .collect(),
                )
            },
            None,
        )
        .await
        .unwrap();

        assert_eq!(
            raw.get_all().await.unwrap(),
            vec![
                serde_json::json!({"id": "t2", "uses": 50, "name": "judo"}),
                serde_json::json!({"id": "t1", "uses": 20, "name": "boxing"}),
                serde_json::json!({"id": "t3", "uses": 0}),
            ]
        );
    }

    #[test]
    fn test_overlay_replaces_non_objects() {
        let stored = serde_json::json!({"id": "t1", "name": "boxing"});
        assert_eq!(
            overlay(stored.clone(), serde_json::json!({"id": "t1", "name": "judo"})),
            serde_json::json!({"id": "t1", "name": "judo"})
        );
        assert_eq!(overlay(stored, serde_json::json!(3)), serde_json::json!(3));
        assert_eq!(
            overlay(serde_json::json!("x"), serde_json::json!({"id": "t1"})),
            serde_json::json!({"id": "t1"})
        );
    }

    #[tokio::test]
    async fn test_custom_id_field() {
        let (store, _dir) = store();
        let tags = Repository::<Tag>::new(&store, Collection::Tags).with_id_field("name");
        tags.insert(tag("t1", "boxing"), None).await.unwrap();

        assert_eq!(tags.id_field(), "name");
        assert!(tags.find_by_id("boxing").await.unwrap().is_some());
        assert!(tags.find_by_id("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_all_error_is_returned_unchanged() {
        #[derive(Debug, PartialEq)]
        enum TagError {
            Duplicate(String),
            Store(String),
        }
        impl From<StoreError> for TagError {
            fn from(e: StoreError) -> Self {
                TagError::Store(e.to_string())
            }
        }

        let (store, _dir) = store();
        let tags = Repository::<Tag>::new(&store, Collection::Tags);
        tags.insert(tag("t1", "boxing"), None).await.unwrap();

        let result = tags
            .update_all(
                |mut all| {
                    if all.iter().any(|t| t.name == "boxing") {
                        return Err(TagError::Duplicate("boxing".to_string()));
                    }
                    all.push(tag("t2", "boxing"));
                    Ok(all)
                },
                None,
            )
            .await;
        assert_eq!(result, Err(TagError::Duplicate("boxing".to_string())));
        assert_eq!(tags.get_all().await.unwrap(), vec![tag("t1", "boxing")]);
    }

    #[tokio::test]
    async fn test_mutations_inside_unit_of_work() {
        let (store, _dir) = store();
        let tags = Repository::<Tag>::new(&store, Collection::Tags);
        let users = Repository::<Value>::new(&store, Collection::Users);

        let mut tx = store.begin().await.unwrap();
        let writes = store.stats().backend.writes;
        tags.insert(tag("t1", "boxing"), Some(&mut tx)).await.unwrap();
        users
            .insert(serde_json::json!({"id": "u1"}), Some(&mut tx))
            .await
            .unwrap();
        assert_eq!(tx.collection(Collection::Tags).len(), 1);
        assert_eq!(store.stats().backend.writes, writes);

        tx.commit().await.unwrap();
        assert_eq!(tags.get_all().await.unwrap(), vec![tag("t1", "boxing")]);
        assert_eq!(users.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_edit_leaves_unit_of_work_untouched() {
        let (store, _dir) = store();
        let tags = Repository::<Tag>::new(&store, Collection::Tags);
        let mut tx = store.begin().await.unwrap();

        let result = tags
            .update_all(
                |mut all| {
                    all.push(tag("t1", "boxing"));
                    Err::<Vec<Tag>, _>(StoreError::Database("rejected".to_string()))
                },
                Some(&mut tx),
            )
            .await;
        assert!(result.is_err());
        assert!(!tx.is_dirty());
        tx.rollback();
    }
}
