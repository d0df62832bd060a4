//! # Subscription Store
//!
//! A transactional, versioned registry of flexible-sync query
//! subscriptions. A client declares which subsets of a server-side
//! dataset it wants as numbered *subscription sets*; the store owns:
//!
//! - **Version history**: a totally-ordered sequence of committed sets,
//!   persisted through a multi-version storage layer (frozen snapshots,
//!   single-writer transactions)
//! - **Lifecycle**: each version moves Pending → Bootstrapping → Complete
//!   (or Error); a version reaching Complete supersedes everything older
//! - **Notifications**: callers await a version reaching a target state
//!   and get exactly one terminal outcome, across concurrent writers and
//!   out-of-order updates
//!
//! ## Example
//!
//! ```ignore
//! use subscription_store::{Database, Query, SetState, SubscriptionStore};
//!
//! let db = Database::open("./subscriptions")?;
//! let store = SubscriptionStore::create(db, |version| {
//!     // wake the sync client's uploader
//! })?;
//!
//! let mut mutable = store.get_latest()?.make_mutable_copy()?;
//! mutable.insert_or_assign_named("adults", &Query::new("Person", "age > 21"))?;
//! let committed = mutable.commit()?;
//!
//! let notification = committed.get_state_change_notification(SetState::Complete)?;
//! ```

pub mod db;
pub mod error;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use db::{Database, DbVersion, Snapshot, WriteTransaction};
pub use error::{Result, StoreError};
pub use subscriptions::{
    MutableSubscriptionSet, NewSetCallback, PendingSubscription, SetState, StateNotification,
    Subscription, SubscriptionSet, SubscriptionStore,
};
pub use types::{ObjectId, Query, Timestamp};
