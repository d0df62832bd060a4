//! File-backed multi-version storage for the subscription metadata.
//!
//! The database keeps every committed state reachable as an immutable
//! [`Snapshot`]: readers grab the latest `Arc<Snapshot>` and are isolated
//! from later writes. A single [`WriteTransaction`] may be live at a time;
//! committing persists the data file and publishes the next snapshot
//! without invalidating any reader.

use crate::error::{Result, StoreError};
use crate::types::{ObjectId, Timestamp};
use fs2::FileExt;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic bytes for the store manifest.
const DB_MAGIC: &[u8; 4] = b"FSM\0";

/// Current on-disk format version.
const DB_FORMAT_VERSION: u8 = 1;

/// Monotonically increasing identifier of a committed database state.
pub type DbVersion = u64;

/// Persisted row of the `flx_subscription_sets` table, keyed by the
/// subscription set version (the primary key lives in the table map).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct SubscriptionSetRecord {
    pub state: i64,
    pub snapshot_version: DbVersion,
    pub error: Option<String>,
    /// Embedded `flx_subscriptions` rows, owned by the set.
    pub subscriptions: Vec<SubscriptionRecord>,
}

/// Persisted row of the embedded `flx_subscriptions` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct SubscriptionRecord {
    pub id: ObjectId,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub name: Option<String>,
    pub object_class: String,
    pub query: String,
}

/// All persisted state: the schema-version registry plus the
/// subscription-set table.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct GroupData {
    pub schema_versions: BTreeMap<String, i64>,
    pub sub_sets: BTreeMap<i64, SubscriptionSetRecord>,
}

/// An immutable view of the database at one committed version.
pub struct Snapshot {
    version: DbVersion,
    data: GroupData,
}

impl Snapshot {
    /// The snapshot number this view corresponds to.
    pub fn version(&self) -> DbVersion {
        self.version
    }

    pub(crate) fn group(&self) -> &GroupData {
        &self.data
    }

    /// Recorded schema version for a metadata group, if any.
    pub fn schema_version(&self, group: &str) -> Option<i64> {
        self.data.schema_versions.get(group).copied()
    }
}

struct DbInner {
    path: PathBuf,

    /// Exclusive process lock on the store directory.
    _lock_file: File,

    /// Latest committed snapshot.
    current: RwLock<Arc<Snapshot>>,

    /// True while a write transaction is live.
    writer_active: Mutex<bool>,
    writer_cv: Condvar,
}

/// Handle to the storage layer. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Open the database at `path`, creating it if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let manifest = path.join("MANIFEST");
        if manifest.exists() {
            Self::verify_manifest(&manifest)?;
        } else {
            Self::write_manifest(&manifest)?;
        }

        let lock_file = Self::acquire_lock(&path)?;

        let (version, data) = match Self::load_data(&path)? {
            Some(loaded) => loaded,
            None => (0, GroupData::default()),
        };

        Ok(Self {
            inner: Arc::new(DbInner {
                path,
                _lock_file: lock_file,
                current: RwLock::new(Arc::new(Snapshot { version, data })),
                writer_active: Mutex::new(false),
                writer_cv: Condvar::new(),
            }),
        })
    }

    /// Latest committed snapshot; never blocks writers.
    pub fn latest_snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.inner.current.read())
    }

    /// Version number of the latest committed snapshot.
    pub fn version_of_latest_snapshot(&self) -> DbVersion {
        self.inner.current.read().version
    }

    /// Recorded schema version for a metadata group in the latest
    /// snapshot.
    pub fn schema_version(&self, group: &str) -> Option<i64> {
        self.latest_snapshot().schema_version(group)
    }

    /// Begin a write transaction, blocking until no other writer is live.
    ///
    /// The transaction starts from the latest snapshot and will publish
    /// `version_of_latest_snapshot() + 1` on commit.
    pub fn begin_write(&self) -> WriteTransaction {
        let mut active = self.inner.writer_active.lock();
        while *active {
            self.inner.writer_cv.wait(&mut active);
        }
        *active = true;
        drop(active);

        let base = self.latest_snapshot();
        WriteTransaction {
            db: self.clone(),
            data: base.group().clone(),
            version: base.version() + 1,
            stage: TransactStage::Writing,
        }
    }

    fn release_writer(&self) {
        let mut active = self.inner.writer_active.lock();
        *active = false;
        self.inner.writer_cv.notify_one();
    }

    fn publish(&self, snapshot: Arc<Snapshot>) {
        *self.inner.current.write() = snapshot;
    }

    // --- Private Helpers ---

    fn data_path(path: &Path) -> PathBuf {
        path.join("metadata.bin")
    }

    fn persist(&self, version: DbVersion, data: &GroupData) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(Self::data_path(&self.inner.path))?;

        file.write_all(DB_MAGIC)?;
        file.write_all(&[DB_FORMAT_VERSION])?;
        file.write_all(&version.to_le_bytes())?;

        let encoded = rmp_serde::to_vec(data)?;
        file.write_all(&(encoded.len() as u64).to_le_bytes())?;
        file.write_all(&encoded)?;

        file.sync_all()?;
        Ok(())
    }

    fn load_data(path: &Path) -> Result<Option<(DbVersion, GroupData)>> {
        let data_path = Self::data_path(path);
        if !data_path.exists() {
            return Ok(None);
        }

        let mut file = File::open(data_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != DB_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid data file magic".into()));
        }

        let mut format = [0u8; 1];
        file.read_exact(&mut format)?;
        if format[0] != DB_FORMAT_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported data file version: {}",
                format[0]
            )));
        }

        let mut version_bytes = [0u8; 8];
        file.read_exact(&mut version_bytes)?;
        let version = DbVersion::from_le_bytes(version_bytes);

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;
        let data: GroupData = rmp_serde::from_slice(&encoded)?;

        Ok(Some((version, data)))
    }

    fn write_manifest(manifest: &Path) -> Result<()> {
        let mut file = File::create(manifest)?;
        file.write_all(DB_MAGIC)?;
        file.write_all(&[DB_FORMAT_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(manifest: &Path) -> Result<()> {
        let mut file = File::open(manifest)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != DB_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != DB_FORMAT_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;
        Ok(lock_file)
    }
}

enum TransactStage {
    Writing,
    Reading(Arc<Snapshot>),
}

/// Exclusive write transaction over the group data.
///
/// Dropping an uncommitted transaction rolls back all edits.
pub struct WriteTransaction {
    db: Database,
    data: GroupData,
    version: DbVersion,
    stage: TransactStage,
}

impl WriteTransaction {
    /// The snapshot number this transaction will publish on commit.
    pub fn version(&self) -> DbVersion {
        self.version
    }

    /// Whether the transaction can still be written to.
    pub fn is_writing(&self) -> bool {
        matches!(self.stage, TransactStage::Writing)
    }

    /// The snapshot this transaction committed as, if it has committed.
    pub fn committed_snapshot(&self) -> Option<&Arc<Snapshot>> {
        match &self.stage {
            TransactStage::Reading(snapshot) => Some(snapshot),
            TransactStage::Writing => None,
        }
    }

    pub(crate) fn group(&self) -> &GroupData {
        match &self.stage {
            TransactStage::Writing => &self.data,
            TransactStage::Reading(snapshot) => snapshot.group(),
        }
    }

    pub(crate) fn group_mut(&mut self) -> &mut GroupData {
        debug_assert!(self.is_writing());
        &mut self.data
    }

    /// Recorded schema version for a metadata group as seen by this
    /// transaction.
    pub fn schema_version(&self, group: &str) -> Option<i64> {
        self.group().schema_versions.get(group).copied()
    }

    /// Record the schema version for a metadata group.
    pub fn set_schema_version(&mut self, group: &str, version: i64) -> Result<()> {
        if !self.is_writing() {
            return Err(StoreError::LogicError(
                "write transaction has already been committed".into(),
            ));
        }
        self.group_mut()
            .schema_versions
            .insert(group.to_string(), version);
        Ok(())
    }

    /// Persist and publish the new snapshot, then continue as a read
    /// transaction pinned to it.
    pub fn commit_and_continue_as_read(&mut self) -> Result<Arc<Snapshot>> {
        if !self.is_writing() {
            return Err(StoreError::LogicError(
                "write transaction has already been committed".into(),
            ));
        }

        self.db.persist(self.version, &self.data)?;

        let snapshot = Arc::new(Snapshot {
            version: self.version,
            data: std::mem::take(&mut self.data),
        });
        self.db.publish(Arc::clone(&snapshot));
        self.db.release_writer();
        self.stage = TransactStage::Reading(Arc::clone(&snapshot));

        Ok(snapshot)
    }

    /// Commit and drop the transaction.
    pub fn commit(mut self) -> Result<Arc<Snapshot>> {
        self.commit_and_continue_as_read()
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        if self.is_writing() {
            self.db.release_writer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_record(state: i64) -> SubscriptionSetRecord {
        SubscriptionSetRecord {
            state,
            snapshot_version: 0,
            error: None,
            subscriptions: Vec::new(),
        }
    }

    #[test]
    fn test_open_fresh() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("db")).unwrap();

        assert_eq!(db.version_of_latest_snapshot(), 0);
        assert!(db.latest_snapshot().group().sub_sets.is_empty());
    }

    #[test]
    fn test_commit_bumps_version() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("db")).unwrap();

        let mut tr = db.begin_write();
        assert_eq!(tr.version(), 1);
        tr.group_mut().sub_sets.insert(0, sample_record(1));
        let snapshot = tr.commit_and_continue_as_read().unwrap();

        assert_eq!(snapshot.version(), 1);
        assert_eq!(db.version_of_latest_snapshot(), 1);
    }

    #[test]
    fn test_snapshot_isolation() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("db")).unwrap();

        let before = db.latest_snapshot();

        let mut tr = db.begin_write();
        tr.group_mut().sub_sets.insert(0, sample_record(1));
        tr.commit_and_continue_as_read().unwrap();

        // The old snapshot still sees the empty table.
        assert!(before.group().sub_sets.is_empty());
        assert_eq!(db.latest_snapshot().group().sub_sets.len(), 1);
    }

    #[test]
    fn test_drop_rolls_back() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("db")).unwrap();

        {
            let mut tr = db.begin_write();
            tr.group_mut().sub_sets.insert(0, sample_record(1));
            // Dropped without commit.
        }

        assert_eq!(db.version_of_latest_snapshot(), 0);
        assert!(db.latest_snapshot().group().sub_sets.is_empty());

        // The writer slot was released; a new writer can start.
        let tr = db.begin_write();
        assert_eq!(tr.version(), 1);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");

        {
            let db = Database::open(&path).unwrap();
            let mut tr = db.begin_write();
            tr.group_mut()
                .schema_versions
                .insert("group".to_string(), 2);
            tr.group_mut().sub_sets.insert(0, sample_record(1));
            tr.commit_and_continue_as_read().unwrap();
        }

        {
            let db = Database::open(&path).unwrap();
            assert_eq!(db.version_of_latest_snapshot(), 1);
            let snapshot = db.latest_snapshot();
            assert_eq!(snapshot.group().schema_versions.get("group"), Some(&2));
            assert_eq!(snapshot.group().sub_sets.len(), 1);
        }
    }

    #[test]
    fn test_second_opener_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");

        let _db = Database::open(&path).unwrap();
        let result = Database::open(&path);
        assert!(matches!(result, Err(StoreError::Locked)));
    }

    #[test]
    fn test_commit_twice_is_logic_error() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("db")).unwrap();

        let mut tr = db.begin_write();
        tr.commit_and_continue_as_read().unwrap();
        let result = tr.commit_and_continue_as_read();
        assert!(matches!(result, Err(StoreError::LogicError(_))));
    }
}
