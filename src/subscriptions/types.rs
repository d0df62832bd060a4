//! Domain types for subscription sets.

use crate::db::{DbVersion, SubscriptionRecord};
use crate::error::{Result, StoreError};
use crate::types::{ObjectId, Timestamp};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a subscription set.
///
/// `Uncommitted`, `Pending`, `Bootstrapping` and `Complete` form a
/// monotonic ladder; `Error` and `Superseded` are terminal sinks outside
/// it. Only `Pending` through `Error` are ever persisted — the other two
/// exist on in-memory views only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetState {
    /// The set lives in an editor that has never been committed.
    Uncommitted,
    /// Committed and waiting to be sent to the server.
    Pending,
    /// The server is delivering the initial data for this set.
    Bootstrapping,
    /// Bootstrap finished; this is the active set.
    Complete,
    /// The server rejected the set; the error text is persisted.
    Error,
    /// A newer set reached `Complete` and this row was deleted.
    Superseded,
}

impl SetState {
    fn rank(self) -> i64 {
        match self {
            SetState::Uncommitted => 0,
            SetState::Pending => 1,
            SetState::Bootstrapping => 2,
            SetState::Complete => 3,
            SetState::Error => 4,
            SetState::Superseded => 5,
        }
    }

    /// Whether this state is at or past `target` on the state ladder.
    ///
    /// All state comparisons in notification handling go through this
    /// single relation.
    pub fn reached(self, target: SetState) -> bool {
        self.rank() >= target.rank()
    }

    pub(crate) fn to_persisted(self) -> i64 {
        self.rank()
    }

    pub(crate) fn from_persisted(value: i64) -> Result<Self> {
        match value {
            0 => Ok(SetState::Uncommitted),
            1 => Ok(SetState::Pending),
            2 => Ok(SetState::Bootstrapping),
            3 => Ok(SetState::Complete),
            4 => Ok(SetState::Error),
            5 => Ok(SetState::Superseded),
            other => Err(StoreError::Deserialization(format!(
                "invalid subscription set state: {}",
                other
            ))),
        }
    }
}

/// A single query subscription inside a set.
///
/// Immutable from the outside; the mutable set updates fields through
/// crate-internal access during an upsert.
#[derive(Clone, Debug)]
pub struct Subscription {
    pub(crate) id: ObjectId,
    pub(crate) created_at: Timestamp,
    pub(crate) updated_at: Timestamp,
    pub(crate) name: Option<String>,
    pub(crate) object_class_name: String,
    pub(crate) query_string: String,
}

impl Subscription {
    /// Create a fresh subscription, stamping both timestamps to now.
    pub(crate) fn new(name: Option<String>, object_class_name: String, query_string: String) -> Self {
        let now = Timestamp::now();
        Self {
            id: ObjectId::gen(),
            created_at: now,
            updated_at: now,
            name,
            object_class_name,
            query_string,
        }
    }

    pub(crate) fn from_record(record: &SubscriptionRecord) -> Self {
        Self {
            id: record.id,
            created_at: record.created_at,
            updated_at: record.updated_at,
            name: record.name.clone(),
            object_class_name: record.object_class.clone(),
            query_string: record.query.clone(),
        }
    }

    pub(crate) fn to_record(&self) -> SubscriptionRecord {
        SubscriptionRecord {
            id: self.id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            name: self.name.clone(),
            object_class: self.object_class_name.clone(),
            query: self.query_string.clone(),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    pub fn has_name(&self) -> bool {
        self.name.is_some()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn object_class_name(&self) -> &str {
        &self.object_class_name
    }

    pub fn query_string(&self) -> &str {
        &self.query_string
    }
}

/// A pending set version paired with the snapshot it was committed at,
/// as returned by [`SubscriptionStore::get_next_pending_version`].
///
/// [`SubscriptionStore::get_next_pending_version`]:
/// crate::SubscriptionStore::get_next_pending_version
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingSubscription {
    pub query_version: i64,
    pub snapshot_version: DbVersion,
}
