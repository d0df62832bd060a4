//! The subscription store: version history, queries and supersedence.

use super::notify::NotificationCenter;
use super::set::{MutableSubscriptionSet, SubscriptionSet};
use super::types::{PendingSubscription, SetState};
use crate::db::{Database, DbVersion, Snapshot, SubscriptionSetRecord, WriteTransaction};
use crate::error::{Result, StoreError};
use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Schema group the subscription metadata registers under.
const FLX_SUBSCRIPTION_STORE_GROUP: &str = "flx_subscription_store";

/// Current schema version of the subscription metadata tables.
const FLX_SCHEMA_VERSION: i64 = 2;

/// Callback invoked after a commit that results in a Pending set; the
/// sync client uses it to wake its uploader.
pub type NewSetCallback = Box<dyn Fn(i64) + Send + Sync>;

/// Authority over the totally-ordered history of subscription set
/// versions: answers version queries, opens editors, and owns the
/// notification center.
pub struct SubscriptionStore {
    db: Database,
    on_new_subscription_set: NewSetCallback,
    notifier: NotificationCenter,
    weak_self: Weak<SubscriptionStore>,
}

impl SubscriptionStore {
    /// Open a store over `db`, installing or verifying the metadata
    /// schema and seeding the version-0 set if the table is empty.
    pub fn create(
        db: Database,
        on_new_subscription_set: impl Fn(i64) + Send + Sync + 'static,
    ) -> Result<Arc<Self>> {
        let store = Arc::new_cyclic(|weak| Self {
            db,
            on_new_subscription_set: Box::new(on_new_subscription_set),
            notifier: NotificationCenter::new(),
            weak_self: weak.clone(),
        });
        store.bootstrap()?;
        Ok(store)
    }

    /// Install the schema-version registry entry on first open, verify it
    /// on later opens, and seed the version-0 Pending set so that
    /// `get_latest` always has something to return.
    fn bootstrap(&self) -> Result<()> {
        match self.db.schema_version(FLX_SUBSCRIPTION_STORE_GROUP) {
            None => {
                let mut tr = self.db.begin_write();
                // Re-check inside the write transaction: another opener may
                // have installed the schema while we waited for the slot.
                match tr.schema_version(FLX_SUBSCRIPTION_STORE_GROUP) {
                    None => {
                        tr.set_schema_version(FLX_SUBSCRIPTION_STORE_GROUP, FLX_SCHEMA_VERSION)?;
                        tr.commit()?;
                        debug!(version = FLX_SCHEMA_VERSION, "installed subscription schema");
                    }
                    Some(version) if version != FLX_SCHEMA_VERSION => {
                        return Err(StoreError::InvalidSchemaVersion {
                            expected: FLX_SCHEMA_VERSION,
                            got: version,
                        });
                    }
                    Some(_) => {}
                }
            }
            Some(version) if version != FLX_SCHEMA_VERSION => {
                return Err(StoreError::InvalidSchemaVersion {
                    expected: FLX_SCHEMA_VERSION,
                    got: version,
                });
            }
            Some(_) => {}
        }

        if self.db.latest_snapshot().group().sub_sets.is_empty() {
            let mut tr = self.db.begin_write();
            if tr.group().sub_sets.is_empty() {
                let seed = SubscriptionSetRecord {
                    state: SetState::Pending.to_persisted(),
                    snapshot_version: tr.version(),
                    error: None,
                    subscriptions: Vec::new(),
                };
                tr.group_mut().sub_sets.insert(0, seed);
                tr.commit()?;
                debug!("seeded initial subscription set at version 0");
            }
        }

        Ok(())
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    pub(crate) fn notifier(&self) -> &NotificationCenter {
        &self.notifier
    }

    pub(crate) fn notify_new_subscription_set(&self, version: i64) {
        debug!(version, "new pending subscription set");
        (self.on_new_subscription_set)(version);
    }

    /// Build a read view of `version` as of `snapshot`.
    pub(crate) fn set_from_snapshot(
        &self,
        snapshot: &Arc<Snapshot>,
        version: i64,
    ) -> Result<SubscriptionSet> {
        let record = snapshot
            .group()
            .sub_sets
            .get(&version)
            .ok_or(StoreError::KeyNotFound(version))?;
        SubscriptionSet::from_record(self.weak_self.clone(), snapshot.version(), version, record)
    }

    /// The set with the highest version.
    pub fn get_latest(&self) -> Result<SubscriptionSet> {
        let snapshot = self.db.latest_snapshot();
        match snapshot.group().sub_sets.keys().next_back().copied() {
            Some(version) => self.set_from_snapshot(&snapshot, version),
            None => Ok(SubscriptionSet::empty(
                self.weak_self.clone(),
                snapshot.version(),
            )),
        }
    }

    /// The highest-versioned Complete set, or an empty view if no set has
    /// completed yet.
    pub fn get_active(&self) -> Result<SubscriptionSet> {
        let snapshot = self.db.latest_snapshot();
        let complete = SetState::Complete.to_persisted();
        let active = snapshot
            .group()
            .sub_sets
            .iter()
            .rev()
            .find(|(_, record)| record.state == complete)
            .map(|(&version, _)| version);
        match active {
            Some(version) => self.set_from_snapshot(&snapshot, version),
            None => Ok(SubscriptionSet::empty(
                self.weak_self.clone(),
                snapshot.version(),
            )),
        }
    }

    /// The `(active, latest)` version pair; active is `-1` while no set
    /// is Complete, and both are `0` on an empty table.
    pub fn get_active_and_latest_versions(&self) -> (i64, i64) {
        let snapshot = self.db.latest_snapshot();
        let sub_sets = &snapshot.group().sub_sets;
        let latest = match sub_sets.keys().next_back().copied() {
            Some(version) => version,
            None => return (0, 0),
        };
        let complete = SetState::Complete.to_persisted();
        let active = sub_sets
            .iter()
            .rev()
            .find(|(_, record)| record.state == complete)
            .map_or(-1, |(&version, _)| version);
        (active, latest)
    }

    /// Exact version lookup. A version that has been superseded away
    /// yields a synthetic Superseded view; anything else missing is
    /// `KeyNotFound`.
    pub fn get_by_version(&self, version: i64) -> Result<SubscriptionSet> {
        let snapshot = self.db.latest_snapshot();
        match self.set_from_snapshot(&snapshot, version) {
            Ok(set) => Ok(set),
            Err(StoreError::KeyNotFound(_)) => {
                if version < self.notifier.min_outstanding_version() {
                    Ok(SubscriptionSet::superseded(self.weak_self.clone(), version))
                } else {
                    Err(StoreError::KeyNotFound(version))
                }
            }
            Err(err) => Err(err),
        }
    }

    /// The smallest version above `last_query_version` that is Pending or
    /// Bootstrapping and was committed at or after `after_client_version`.
    pub fn get_next_pending_version(
        &self,
        last_query_version: i64,
        after_client_version: DbVersion,
    ) -> Option<PendingSubscription> {
        let snapshot = self.db.latest_snapshot();
        let pending = SetState::Pending.to_persisted();
        let bootstrapping = SetState::Bootstrapping.to_persisted();
        snapshot
            .group()
            .sub_sets
            .range((Bound::Excluded(last_query_version), Bound::Unbounded))
            .find(|(_, record)| {
                (record.state == pending || record.state == bootstrapping)
                    && record.snapshot_version >= after_client_version
            })
            .map(|(&version, record)| PendingSubscription {
                query_version: version,
                snapshot_version: record.snapshot_version,
            })
    }

    /// All sets still waiting on the server, in increasing version order,
    /// starting after the active set. Used by the sync client to recover
    /// outstanding work after a restart.
    pub fn get_pending_subscriptions(&self) -> Result<Vec<SubscriptionSet>> {
        let mut pending = Vec::new();
        let active = self.get_active()?;
        let mut cur_query_version = active.version();
        let mut db_version = 0;
        if active.state() == SetState::Complete {
            db_version = active.snapshot_version();
        }
        while let Some(next) = self.get_next_pending_version(cur_query_version, db_version) {
            cur_query_version = next.query_version;
            db_version = next.snapshot_version;
            pending.push(self.get_by_version(cur_query_version)?);
        }
        Ok(pending)
    }

    /// Distinct object class names referenced by the latest set.
    pub fn get_tables_for_latest(&self) -> BTreeSet<String> {
        let snapshot = self.db.latest_snapshot();
        let sub_sets = &snapshot.group().sub_sets;
        match sub_sets.values().next_back() {
            Some(record) => record
                .subscriptions
                .iter()
                .map(|sub| sub.object_class.clone())
                .collect(),
            None => BTreeSet::new(),
        }
    }

    /// Open an editor over an existing version, taking the write
    /// transaction.
    pub fn get_mutable_by_version(&self, version: i64) -> Result<MutableSubscriptionSet> {
        let tr = self.db.begin_write();
        MutableSubscriptionSet::from_row(self.weak_self.clone(), tr, version)
    }

    /// Allocate the next version and return an editor pre-populated with
    /// a copy of `set`'s subscriptions.
    pub fn make_mutable_copy(&self, set: &SubscriptionSet) -> Result<MutableSubscriptionSet> {
        let mut tr = self.db.begin_write();
        let new_version = tr
            .group()
            .sub_sets
            .keys()
            .next_back()
            .copied()
            .map_or(0, |version| version + 1);
        tr.group_mut()
            .sub_sets
            .insert(new_version, SubscriptionSetRecord::default());
        Ok(MutableSubscriptionSet::new_uncommitted(
            self.weak_self.clone(),
            tr,
            new_version,
            set.subs().to_vec(),
        ))
    }

    /// Delete every set with a version below `version` within `tx`.
    pub fn supercede_prior_to(&self, tx: &mut WriteTransaction, version: i64) {
        debug!(version, "superceding subscription sets prior to version");
        tx.group_mut()
            .sub_sets
            .retain(|&set_version, _| set_version >= version);
    }

    /// Delete every set other than the editor's within its transaction,
    /// advance the supersedence watermark to it, and resolve every
    /// pending notification for any other version as Superseded.
    pub fn supercede_all_except(&self, mut_sub: &mut MutableSubscriptionSet) {
        let version_to_keep = mut_sub.version();
        debug!(version_to_keep, "superceding all other subscription sets");
        mut_sub
            .tx_mut()
            .group_mut()
            .sub_sets
            .retain(|&set_version, _| set_version == version_to_keep);
        self.notifier.supercede_all_except(version_to_keep);
    }

    /// Whether a view loaded from snapshot `version` would see newer data
    /// after a refresh.
    pub fn would_refresh(&self, version: DbVersion) -> bool {
        version < self.db.version_of_latest_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> Arc<SubscriptionStore> {
        let db = Database::open(dir.path().join("store")).unwrap();
        SubscriptionStore::create(db, |_| {}).unwrap()
    }

    #[test]
    fn test_fresh_open_seeds_version_zero() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let latest = store.get_latest().unwrap();
        assert_eq!(latest.version(), 0);
        assert_eq!(latest.state(), SetState::Pending);
        assert!(latest.is_empty());
        assert_eq!(store.get_active_and_latest_versions(), (-1, 0));
    }

    #[test]
    fn test_reopen_keeps_schema_and_seed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store");

        {
            let db = Database::open(&path).unwrap();
            SubscriptionStore::create(db, |_| {}).unwrap();
        }
        {
            let db = Database::open(&path).unwrap();
            let store = SubscriptionStore::create(db, |_| {}).unwrap();
            assert_eq!(store.get_latest().unwrap().version(), 0);
        }
    }

    #[test]
    fn test_mismatched_schema_version_fails_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store");

        {
            let db = Database::open(&path).unwrap();
            let mut tr = db.begin_write();
            tr.set_schema_version(FLX_SUBSCRIPTION_STORE_GROUP, 1).unwrap();
            tr.commit().unwrap();
        }

        let db = Database::open(&path).unwrap();
        let result = SubscriptionStore::create(db, |_| {});
        assert!(matches!(
            result,
            Err(StoreError::InvalidSchemaVersion {
                expected: FLX_SCHEMA_VERSION,
                got: 1
            })
        ));
    }

    #[test]
    fn test_make_mutable_copy_allocates_next_version() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let latest = store.get_latest().unwrap();
        let first = store.make_mutable_copy(&latest).unwrap();
        assert_eq!(first.version(), 1);
        let committed = first.commit().unwrap();

        let second = store.make_mutable_copy(&committed).unwrap();
        assert_eq!(second.version(), 2);
    }

    #[test]
    fn test_get_by_version_missing_is_key_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let result = store.get_by_version(17);
        assert!(matches!(result, Err(StoreError::KeyNotFound(17))));
    }

    #[test]
    fn test_get_tables_for_latest() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
        mutable
            .insert_or_assign_named("a", &crate::types::Query::new("Person", "age > 1"))
            .unwrap();
        mutable
            .insert_or_assign_named("b", &crate::types::Query::new("Dog", "good == true"))
            .unwrap();
        mutable
            .insert_or_assign_named("c", &crate::types::Query::new("Person", "age > 2"))
            .unwrap();
        mutable.commit().unwrap();

        let tables = store.get_tables_for_latest();
        assert_eq!(
            tables.into_iter().collect::<Vec<_>>(),
            vec!["Dog".to_string(), "Person".to_string()]
        );
    }

    #[test]
    fn test_supercede_all_except_keeps_only_editor_version() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let v1 = store
            .get_latest()
            .unwrap()
            .make_mutable_copy()
            .unwrap()
            .commit()
            .unwrap();
        let mut editor = store.make_mutable_copy(&v1).unwrap();
        let kept = editor.version();

        store.supercede_all_except(&mut editor);
        let committed = editor.commit().unwrap();
        assert_eq!(committed.version(), kept);

        assert_eq!(store.get_latest().unwrap().version(), kept);
        let superseded = store.get_by_version(v1.version()).unwrap();
        assert_eq!(superseded.state(), SetState::Superseded);
    }

    #[test]
    fn test_would_refresh() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let cur = store.db().version_of_latest_snapshot();
        assert!(!store.would_refresh(cur));

        store
            .get_latest()
            .unwrap()
            .make_mutable_copy()
            .unwrap()
            .commit()
            .unwrap();
        assert!(store.would_refresh(cur));
    }
}
