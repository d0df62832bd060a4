//! Versioned query subscription sets and their lifecycle.
//!
//! A subscription set is a numbered, atomic bundle of query subscriptions
//! that the sync client submits to the server. This module provides:
//! - frozen read views of any committed version
//! - a write-transaction-scoped editor producing the next version
//! - the per-version state machine (Pending → Bootstrapping → Complete,
//!   with Error and Superseded as terminal sinks)
//! - one-shot notifications for a version reaching a target state
//!
//! # Example
//!
//! ```ignore
//! let db = Database::open("./subscriptions")?;
//! let store = SubscriptionStore::create(db, |version| {
//!     println!("new pending set: {version}");
//! })?;
//!
//! let mut mutable = store.get_latest()?.make_mutable_copy()?;
//! mutable.insert_or_assign_named("adults", &Query::new("Person", "age > 21"))?;
//! let committed = mutable.commit()?;
//!
//! let notification = committed.get_state_change_notification(SetState::Complete)?;
//! // ... the sync client drives the set through Bootstrapping to Complete
//! let state = notification.recv()?;
//! ```

mod notify;
mod set;
mod store;
mod types;

pub use notify::StateNotification;
pub use set::{MutableSubscriptionSet, SubscriptionSet};
pub use store::{NewSetCallback, SubscriptionStore};
pub use types::{PendingSubscription, SetState, Subscription};
