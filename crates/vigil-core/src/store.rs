//! Sled-backed liveness store with per-user write serialization.
//!
//! Two trees live in one database:
//!
//! | Tree               | Key                          | Value                       |
//! |--------------------|------------------------------|-----------------------------|
//! | `liveness_records` | user id (BE i64)             | JSON `LivenessRecord`       |
//! | `activity_checks`  | user id (BE i64) + seq (BE)  | JSON `ActivityCheckEvent`   |
//!
//! Read-modify-write sequences on one user's record must hold the guard from
//! [`LivenessStore::lock_user`]; different users never contend.

use crate::error::{Result, VigilError};
use crate::model::{ActivityCheckEvent, LivenessRecord, UserId};
use dashmap::DashMap;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

const RECORDS_TREE: &str = "liveness_records";
const EVENTS_TREE: &str = "activity_checks";

/// Durable per-user liveness state, owned exclusively by the engine.
pub struct LivenessStore {
    db: Db,
    records: Tree,
    events: Tree,
    /// One async mutex per user id, created on first use.
    locks: DashMap<UserId, Arc<Mutex<()>>>,
    closed: AtomicBool,
}

impl LivenessStore {
    /// Opens or creates the store at the given path.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Builds the store on an already-open sled database (shared with the ledger).
    pub fn from_db(db: Db) -> Result<Self> {
        let records = db.open_tree(RECORDS_TREE)?;
        let events = db.open_tree(EVENTS_TREE)?;
        Ok(Self {
            db,
            records,
            events,
            locks: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Serializes access to one user's record. Hold the guard for the whole
    /// read-modify-write, including any notifier call in between.
    pub async fn lock_user(&self, user: UserId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(user)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub fn get(&self, user: UserId) -> Result<Option<LivenessRecord>> {
        self.ensure_open()?;
        match self.records.get(user.to_key())? {
            Some(bytes) => Ok(Some(LivenessRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, record: &LivenessRecord) -> Result<()> {
        self.ensure_open()?;
        self.records
            .insert(record.user_id.to_key(), record.to_bytes()?)?;
        debug!(
            target: "vigil::store",
            user_id = %record.user_id,
            retry_count = record.retry_count,
            is_active = record.is_active,
            "liveness record saved"
        );
        Ok(())
    }

    /// All records ordered by user id.
    pub fn records(&self) -> Result<Vec<LivenessRecord>> {
        self.ensure_open()?;
        self.records
            .iter()
            .values()
            .map(|v| -> Result<LivenessRecord> { Ok(LivenessRecord::from_bytes(&v?)?) })
            .collect()
    }

    /// Refreshes the display label without touching check state.
    /// Returns `false` when the user has no record yet.
    pub async fn update_username(&self, user: UserId, username: &str) -> Result<bool> {
        let _guard = self.lock_user(user).await;
        let Some(mut record) = self.get(user)? else {
            return Ok(false);
        };
        if record.username != username {
            record.username = username.to_string();
            self.put(&record)?;
        }
        Ok(true)
    }

    /// Appends an audit row; returns its sequence number.
    pub fn append_event(&self, event: &ActivityCheckEvent) -> Result<u64> {
        self.ensure_open()?;
        let seq = self.db.generate_id()?;
        let mut key = Vec::with_capacity(16);
        key.extend_from_slice(&event.user_id.to_key());
        key.extend_from_slice(&seq.to_be_bytes());
        self.events.insert(key, serde_json::to_vec(event)?)?;
        Ok(seq)
    }

    /// A user's audit trail, oldest first.
    pub fn events_for(&self, user: UserId) -> Result<Vec<ActivityCheckEvent>> {
        self.ensure_open()?;
        self.events
            .scan_prefix(user.to_key())
            .values()
            .map(|v| -> Result<ActivityCheckEvent> { Ok(serde_json::from_slice(&v?)?) })
            .collect()
    }

    /// Rejects all further access and flushes to disk. Late timer callbacks then get
    /// `VigilError::ShutDown` instead of touching a torn-down database.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let bytes = self.db.flush()?;
        info!(target: "vigil::store", flushed_bytes = bytes, "liveness store closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(VigilError::ShutDown)
        } else {
            Ok(())
        }
    }
}
