//! Collection schema and graph normalization.
//!
//! The store knows a closed set of collections. Every [`Graph`] handed to a
//! caller contains all of them, each mapped to a sequence, no matter what the
//! backing medium returned:
//!
//! ```text
//! raw JSON ──► normalize ──► Graph
//!   { "users": [..],            users    → [..]
//!     "posts": 42,              posts    → []      (non-sequence replaced)
//!     "legacy": [..] }          comments → []      (missing key filled)
//!                               ...                (unknown keys dropped)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// The known collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Users,
    Posts,
    Comments,
    Fights,
    Bets,
    Votes,
    Divisions,
    Badges,
    Notifications,
    Tags,
}

impl Collection {
    /// Every collection, in canonical order.
    pub const ALL: [Collection; 10] = [
        Collection::Users,
        Collection::Posts,
        Collection::Comments,
        Collection::Fights,
        Collection::Bets,
        Collection::Votes,
        Collection::Divisions,
        Collection::Badges,
        Collection::Notifications,
        Collection::Tags,
    ];

    /// Stable storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Posts => "posts",
            Collection::Comments => "comments",
            Collection::Fights => "fights",
            Collection::Bets => "bets",
            Collection::Votes => "votes",
            Collection::Divisions => "divisions",
            Collection::Badges => "badges",
            Collection::Notifications => "notifications",
            Collection::Tags => "tags",
        }
    }

    /// Fields the remote backend keeps equality indexes on.
    ///
    /// Always starts with `id`.
    pub fn indexed_fields(self) -> &'static [&'static str] {
        match self {
            Collection::Users => &["id", "email", "username"],
            Collection::Posts => &["id", "authorId"],
            Collection::Comments => &["id", "postId"],
            Collection::Fights => &["id", "status"],
            Collection::Bets => &["id", "userId", "fightId"],
            Collection::Votes => &["id", "postId", "userId"],
            Collection::Divisions => &["id"],
            Collection::Badges => &["id", "userId"],
            Collection::Notifications => &["id", "userId"],
            Collection::Tags => &["id", "name"],
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| StoreError::UnknownCollection(s.to_string()))
    }
}

/// The full document graph: every collection mapped to its records.
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    collections: BTreeMap<Collection, Vec<Value>>,
}

impl Graph {
    /// A graph with every collection present and empty.
    pub fn empty() -> Self {
        Self {
            collections: Collection::ALL.into_iter().map(|c| (c, Vec::new())).collect(),
        }
    }

    /// Records of one collection.
    pub fn get(&self, collection: Collection) -> &[Value] {
        self.collections
            .get(&collection)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get_mut(&mut self, collection: Collection) -> &mut Vec<Value> {
        self.collections.entry(collection).or_default()
    }

    /// Replace one collection wholesale.
    pub fn set(&mut self, collection: Collection, records: Vec<Value>) {
        self.collections.insert(collection, records);
    }

    /// Move a collection's records out, leaving it empty.
    pub fn take(&mut self, collection: Collection) -> Vec<Value> {
        std::mem::take(self.get_mut(collection))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Collection, &[Value])> {
        self.collections.iter().map(|(c, r)| (*c, r.as_slice()))
    }

    /// Collections whose content differs between `self` and `next`.
    pub fn changed_collections(&self, next: &Graph) -> Vec<Collection> {
        Collection::ALL
            .into_iter()
            .filter(|c| self.get(*c) != next.get(*c))
            .collect()
    }

    /// Total number of records across all collections.
    pub fn record_count(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }

    /// JSON object form, keyed by collection name.
    pub fn to_value(&self) -> Value {
        let map: Map<String, Value> = self
            .collections
            .iter()
            .map(|(c, r)| (c.as_str().to_string(), Value::Array(r.clone())))
            .collect();
        Value::Object(map)
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::empty()
    }
}

impl Serialize for Graph {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.collections.iter().map(|(c, r)| (c.as_str(), r)))
    }
}

impl<'de> Deserialize<'de> for Graph {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(normalize)
    }
}

/// Coerce an arbitrary JSON value into a well-formed [`Graph`].
///
/// Missing collections and collections holding anything but an array become
/// empty sequences. Keys outside the known set are dropped. Never fails.
pub fn normalize(raw: Value) -> Graph {
    let mut map = match raw {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            log::warn!("Store root is {} instead of an object, starting empty", kind_of(&other));
            Map::new()
        }
    };

    let mut graph = Graph::empty();
    for collection in Collection::ALL {
        match map.remove(collection.as_str()) {
            Some(Value::Array(records)) => graph.set(collection, records),
            Some(other) => {
                log::warn!(
                    "Collection {collection} holds {} instead of a sequence, reset to empty",
                    kind_of(&other)
                );
            }
            None => {}
        }
    }
    graph
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
