//! Core types for the subscription store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Prefix the storage layer puts in front of class-backed table names.
const CLASS_TABLE_PREFIX: &str = "class_";

/// Unique 128-bit identifier for a subscription.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Generate a fresh random id.
    pub fn gen() -> Self {
        ObjectId(Uuid::new_v4())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0.simple())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A query handed in by the query layer: the class it runs over and its
/// canonical textual description.
///
/// The store never parses or evaluates the description; it only needs a
/// stable string to match and upsert subscriptions by.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    object_class: String,
    description: String,
}

impl Query {
    /// Build a query over a class name.
    pub fn new(object_class: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            object_class: object_class.into(),
            description: description.into(),
        }
    }

    /// Build a query from a storage-layer table name, stripping the
    /// `class_` prefix to recover the class name.
    pub fn from_table(table_name: &str, description: impl Into<String>) -> Self {
        let object_class = table_name
            .strip_prefix(CLASS_TABLE_PREFIX)
            .unwrap_or(table_name);
        Self {
            object_class: object_class.to_string(),
            description: description.into(),
        }
    }

    /// The class (table) the query is over.
    pub fn object_class_name(&self) -> &str {
        &self.object_class
    }

    /// Canonical textual form of the query.
    pub fn description(&self) -> &str {
        &self.description
    }
}
