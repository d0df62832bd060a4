//! Subscription set read views and the write-transaction-scoped editor.

use super::notify::{Registration, StateNotification};
use super::store::SubscriptionStore;
use super::types::{SetState, Subscription};
use crate::db::{DbVersion, SubscriptionSetRecord, WriteTransaction};
use crate::error::{Result, StoreError};
use crate::types::{Query, Timestamp};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::debug;

/// A frozen view of one numbered subscription set version.
///
/// Views are loaded from a single database snapshot and are safe to share
/// across threads; they do not observe later commits unless
/// [`refresh`](SubscriptionSet::refresh)ed. The back-reference to the
/// store is weak: a view that outlives its store fails on operations that
/// need it instead of dangling.
#[derive(Clone)]
pub struct SubscriptionSet {
    store: Weak<SubscriptionStore>,
    /// Database snapshot this view was loaded from.
    cur_version: DbVersion,
    version: i64,
    state: SetState,
    error_str: Option<String>,
    snapshot_version: DbVersion,
    subs: Vec<Subscription>,
}

impl SubscriptionSet {
    pub(crate) fn from_record(
        store: Weak<SubscriptionStore>,
        cur_version: DbVersion,
        version: i64,
        record: &SubscriptionSetRecord,
    ) -> Result<Self> {
        Ok(Self {
            store,
            cur_version,
            version,
            state: SetState::from_persisted(record.state)?,
            error_str: record.error.clone(),
            snapshot_version: record.snapshot_version,
            subs: record
                .subscriptions
                .iter()
                .map(Subscription::from_record)
                .collect(),
        })
    }

    /// View of a missing row: version 0, Uncommitted, no subscriptions.
    pub(crate) fn empty(store: Weak<SubscriptionStore>, cur_version: DbVersion) -> Self {
        Self {
            store,
            cur_version,
            version: 0,
            state: SetState::Uncommitted,
            error_str: None,
            snapshot_version: 0,
            subs: Vec::new(),
        }
    }

    /// Synthetic view of a version whose row has been superseded away.
    pub(crate) fn superseded(store: Weak<SubscriptionStore>, version: i64) -> Self {
        Self {
            store,
            cur_version: 0,
            version,
            state: SetState::Superseded,
            error_str: None,
            snapshot_version: 0,
            subs: Vec::new(),
        }
    }

    fn store(&self) -> Result<Arc<SubscriptionStore>> {
        self.store.upgrade().ok_or(StoreError::StoreReleased)
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Storage snapshot captured when this version was committed.
    pub fn snapshot_version(&self) -> DbVersion {
        self.snapshot_version
    }

    pub fn state(&self) -> SetState {
        self.state
    }

    /// The persisted error text; empty unless the state is Error.
    pub fn error_str(&self) -> &str {
        self.error_str.as_deref().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Subscription at `index` in stored order.
    pub fn at(&self, index: usize) -> Option<&Subscription> {
        self.subs.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Subscription> {
        self.subs.iter()
    }

    pub(crate) fn subs(&self) -> &[Subscription] {
        &self.subs
    }

    /// Find a named subscription by its name.
    pub fn find_by_name(&self, name: &str) -> Option<&Subscription> {
        self.subs.iter().find(|sub| sub.name() == Some(name))
    }

    /// Find a subscription matching a query's class and canonical text.
    pub fn find_by_query(&self, query: &Query) -> Option<&Subscription> {
        self.subs.iter().find(|sub| {
            sub.object_class_name() == query.object_class_name()
                && sub.query_string() == query.description()
        })
    }

    /// Open an editor for the next version, cloned from this set.
    pub fn make_mutable_copy(&self) -> Result<MutableSubscriptionSet> {
        self.store()?.make_mutable_copy(self)
    }

    /// Re-read this version from the latest snapshot if the store has
    /// moved past the one this view was loaded from. If the row has been
    /// superseded in the meantime the view reports Superseded afterwards.
    pub fn refresh(&mut self) -> Result<()> {
        let store = self.store()?;
        if store.would_refresh(self.cur_version) {
            *self = store.get_by_version(self.version)?;
        }
        Ok(())
    }

    /// Register for a one-shot notification that fires once this version
    /// reaches `notify_when`, goes to Error, or is superseded.
    ///
    /// If the (freshly reloaded) state already satisfies the target, the
    /// returned notification is resolved immediately.
    pub fn get_state_change_notification(&self, notify_when: SetState) -> Result<StateNotification> {
        let store = self.store()?;
        let notifier = store.notifier();

        // Below the watermark the row is gone and no dispatch will ever
        // match it again.
        let guard = match notifier.begin_register(self.version) {
            Registration::Superseded => {
                return Ok(StateNotification::ready(SetState::Superseded))
            }
            Registration::Open(guard) => guard,
        };

        // The view may be stale; probe the row as of the latest snapshot
        // before deciding whether the target is already satisfied.
        let mut cur_state = self.state;
        let mut err_str = self.error_str.clone();
        if self.cur_version < store.db().version_of_latest_snapshot() {
            let refreshed = store.get_by_version(self.version)?;
            cur_state = refreshed.state;
            err_str = refreshed.error_str;
        }

        if cur_state == SetState::Error {
            return Ok(StateNotification::ready_err(StoreError::Runtime(
                err_str.unwrap_or_default(),
            )));
        }
        if cur_state.reached(notify_when) {
            return Ok(StateNotification::ready(cur_state));
        }

        Ok(guard.enqueue(self.version, notify_when))
    }

    /// Render the set into its canonical server-bound JSON form.
    ///
    /// Queries are grouped per class into a parenthesized `OR` disjunction;
    /// duplicates are dropped and both queries and classes are emitted in
    /// sorted order, so two sets with the same logical content always
    /// produce the same bytes.
    pub fn to_ext_json(&self) -> String {
        if self.subs.is_empty() {
            return "{}".to_string();
        }

        let mut table_to_query: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for sub in &self.subs {
            let queries = table_to_query.entry(sub.object_class_name()).or_default();
            if !queries.contains(&sub.query_string()) {
                queries.push(sub.query_string());
            }
        }

        let mut output = serde_json::Map::new();
        for (table, mut queries) in table_to_query {
            queries.sort();
            let disjunction = queries
                .iter()
                .map(|query| format!("({})", query))
                .collect::<Vec<_>>()
                .join(" OR ");
            output.insert(table.to_string(), serde_json::Value::String(disjunction));
        }

        serde_json::Value::Object(output).to_string()
    }
}

impl<'a> IntoIterator for &'a SubscriptionSet {
    type Item = &'a Subscription;
    type IntoIter = std::slice::Iter<'a, Subscription>;

    fn into_iter(self) -> Self::IntoIter {
        self.subs.iter()
    }
}

/// Editor for the next committed version of a subscription set.
///
/// Holds the store's single write transaction until [`commit`] or drop;
/// dropping without committing rolls back every edit. All mutations fail
/// once the transaction has left the writing stage.
///
/// [`commit`]: MutableSubscriptionSet::commit
pub struct MutableSubscriptionSet {
    store: Weak<SubscriptionStore>,
    tx: WriteTransaction,
    version: i64,
    state: SetState,
    error_str: Option<String>,
    /// State as persisted before this editor was opened; Uncommitted for a
    /// freshly allocated version.
    old_state: SetState,
    subs: Vec<Subscription>,
}

impl MutableSubscriptionSet {
    /// Editor over a freshly allocated, not-yet-committed row.
    pub(crate) fn new_uncommitted(
        store: Weak<SubscriptionStore>,
        tx: WriteTransaction,
        version: i64,
        subs: Vec<Subscription>,
    ) -> Self {
        Self {
            store,
            tx,
            version,
            state: SetState::Uncommitted,
            error_str: None,
            old_state: SetState::Uncommitted,
            subs,
        }
    }

    /// Editor over an existing committed row.
    pub(crate) fn from_row(
        store: Weak<SubscriptionStore>,
        tx: WriteTransaction,
        version: i64,
    ) -> Result<Self> {
        let record = tx
            .group()
            .sub_sets
            .get(&version)
            .ok_or(StoreError::KeyNotFound(version))?;
        let state = SetState::from_persisted(record.state)?;
        let subs = record
            .subscriptions
            .iter()
            .map(Subscription::from_record)
            .collect();
        let error_str = record.error.clone();
        Ok(Self {
            store,
            tx,
            version,
            state,
            error_str,
            old_state: state,
            subs,
        })
    }

    fn store(&self) -> Result<Arc<SubscriptionStore>> {
        self.store.upgrade().ok_or(StoreError::StoreReleased)
    }

    fn check_is_mutable(&self) -> Result<()> {
        if !self.tx.is_writing() {
            return Err(StoreError::LogicError(
                "subscription set can no longer be modified".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn tx_mut(&mut self) -> &mut WriteTransaction {
        &mut self.tx
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn state(&self) -> SetState {
        self.state
    }

    pub fn error_str(&self) -> &str {
        self.error_str.as_deref().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn at(&self, index: usize) -> Option<&Subscription> {
        self.subs.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Subscription> {
        self.subs.iter()
    }

    /// Append a subscription verbatim, keeping its id and timestamps.
    pub fn insert_sub(&mut self, sub: Subscription) -> Result<()> {
        self.check_is_mutable()?;
        self.subs.push(sub);
        Ok(())
    }

    /// Upsert by name: update the named subscription's class, query and
    /// `updated_at` if it exists, append a fresh one otherwise. Returns
    /// the subscription and whether it was inserted.
    pub fn insert_or_assign_named(
        &mut self,
        name: &str,
        query: &Query,
    ) -> Result<(&Subscription, bool)> {
        let found = self
            .subs
            .iter()
            .position(|sub| sub.has_name() && sub.name() == Some(name));
        let (index, inserted) = self.upsert(
            found,
            Some(name.to_string()),
            query.object_class_name().to_string(),
            query.description().to_string(),
        )?;
        Ok((&self.subs[index], inserted))
    }

    /// Upsert an unnamed subscription matched by class and canonical
    /// query text.
    pub fn insert_or_assign(&mut self, query: &Query) -> Result<(&Subscription, bool)> {
        let found = self.subs.iter().position(|sub| {
            !sub.has_name()
                && sub.object_class_name() == query.object_class_name()
                && sub.query_string() == query.description()
        });
        let (index, inserted) = self.upsert(
            found,
            None,
            query.object_class_name().to_string(),
            query.description().to_string(),
        )?;
        Ok((&self.subs[index], inserted))
    }

    fn upsert(
        &mut self,
        found: Option<usize>,
        name: Option<String>,
        object_class_name: String,
        query_string: String,
    ) -> Result<(usize, bool)> {
        self.check_is_mutable()?;
        match found {
            Some(index) => {
                let sub = &mut self.subs[index];
                sub.object_class_name = object_class_name;
                sub.query_string = query_string;
                sub.updated_at = Timestamp::now();
                Ok((index, false))
            }
            None => {
                self.subs
                    .push(Subscription::new(name, object_class_name, query_string));
                Ok((self.subs.len() - 1, true))
            }
        }
    }

    /// Remove the subscription at `index`.
    pub fn erase(&mut self, index: usize) -> Result<Subscription> {
        self.check_is_mutable()?;
        if index >= self.subs.len() {
            return Err(StoreError::LogicError(format!(
                "erase index {} out of bounds (len={})",
                index,
                self.subs.len()
            )));
        }
        Ok(self.subs.remove(index))
    }

    /// Remove all subscriptions.
    pub fn clear(&mut self) -> Result<()> {
        self.check_is_mutable()?;
        self.subs.clear();
        Ok(())
    }

    /// Replace the contents with a copy of `src`.
    pub fn import(&mut self, src: &SubscriptionSet) -> Result<()> {
        self.clear()?;
        for sub in src {
            self.insert_sub(sub.clone())?;
        }
        Ok(())
    }

    /// Advance the set's lifecycle state.
    ///
    /// Legal targets: Bootstrapping and Complete from Pending,
    /// Bootstrapping or Error; Error (with a message) from any
    /// not-yet-Complete state. Pending is assigned implicitly on first
    /// commit, and Uncommitted/Superseded are never accepted. Entering
    /// Complete deletes every older version within the same transaction.
    pub fn update_state(&mut self, new_state: SetState, error_str: Option<&str>) -> Result<()> {
        self.check_is_mutable()?;
        let old_state = self.state;
        match new_state {
            SetState::Uncommitted => {
                return Err(StoreError::LogicError(
                    "cannot set subscription set state to uncommitted".into(),
                ));
            }
            SetState::Pending => {
                return Err(StoreError::LogicError(
                    "cannot set subscription set state to pending".into(),
                ));
            }
            SetState::Superseded => {
                return Err(StoreError::LogicError(
                    "cannot set subscription set state to superseded".into(),
                ));
            }
            SetState::Error => {
                if old_state == SetState::Complete {
                    return Err(StoreError::LogicError(
                        "a complete subscription set cannot transition to error".into(),
                    ));
                }
                let message = error_str.ok_or_else(|| {
                    StoreError::LogicError(
                        "an error message is required when setting the error state".into(),
                    )
                })?;
                self.state = SetState::Error;
                self.error_str = Some(message.to_string());
            }
            SetState::Bootstrapping => {
                self.check_advance_from(old_state, new_state, error_str)?;
                self.state = SetState::Bootstrapping;
                self.error_str = None;
            }
            SetState::Complete => {
                self.check_advance_from(old_state, new_state, error_str)?;
                let store = self.store()?;
                self.state = SetState::Complete;
                self.error_str = None;
                store.supercede_prior_to(&mut self.tx, self.version);
            }
        }
        Ok(())
    }

    fn check_advance_from(
        &self,
        old_state: SetState,
        new_state: SetState,
        error_str: Option<&str>,
    ) -> Result<()> {
        if error_str.is_some() {
            return Err(StoreError::LogicError(
                "an error message is only allowed when setting the error state".into(),
            ));
        }
        match old_state {
            SetState::Pending | SetState::Bootstrapping | SetState::Error => Ok(()),
            _ => Err(StoreError::LogicError(format!(
                "subscription set cannot transition from {:?} to {:?}",
                old_state, new_state
            ))),
        }
    }

    /// Commit the edits and return a frozen view of the committed version.
    ///
    /// A first commit defaults the state to Pending (unless explicitly
    /// advanced), records the storage snapshot version, and writes the
    /// subscription list; later commits persist state and error only.
    /// After the commit becomes visible, pending notifications are
    /// dispatched and, for a Pending result, the store's new-set hook is
    /// invoked.
    pub fn commit(mut self) -> Result<SubscriptionSet> {
        if !self.tx.is_writing() {
            return Err(StoreError::LogicError(
                "subscription set is not in a commitable state".into(),
            ));
        }
        let store = self.store()?;

        if self.old_state == SetState::Uncommitted {
            if self.state == SetState::Uncommitted {
                self.state = SetState::Pending;
            }
            let snapshot_version = self.tx.version();
            let record = self
                .tx
                .group_mut()
                .sub_sets
                .get_mut(&self.version)
                .ok_or(StoreError::KeyNotFound(self.version))?;
            record.snapshot_version = snapshot_version;
            record.subscriptions = self.subs.iter().map(Subscription::to_record).collect();
        }

        {
            let record = self
                .tx
                .group_mut()
                .sub_sets
                .get_mut(&self.version)
                .ok_or(StoreError::KeyNotFound(self.version))?;
            record.state = self.state.to_persisted();
            record.error = self.error_str.clone();
        }

        let version = self.version;
        let snapshot = self.tx.commit_and_continue_as_read()?;

        debug!(version, state = ?self.state, "committed subscription set");

        store
            .notifier()
            .dispatch(version, self.state, self.error_str.as_deref());

        if self.state == SetState::Pending {
            store.notify_new_subscription_set(version);
        }

        store.set_from_snapshot(&snapshot, version)
    }
}
