//! Reputation ledger seam plus the sled-backed implementation the daemon uses.
//!
//! The engine only needs three capabilities: enumerate the user directory, atomically
//! credit points, and read a user's current total. Anything else (leaderboards, money,
//! social credit) belongs to the surrounding bot.

use crate::error::{Result, VigilError};
use crate::model::{UserId, UserRef};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::{debug, info};

const LEDGER_TREE: &str = "reputation";

/// Capability interface over the reputation store.
#[async_trait]
pub trait ReputationLedger: Send + Sync {
    /// Every user known to the bot. Not required to be consistent with a running sweep.
    async fn list_all_users(&self) -> Result<Vec<UserRef>>;

    /// Atomically adds `amount` to the user's alive score.
    async fn add_points(&self, user: UserId, amount: i64) -> Result<()>;

    /// Point-in-time read of the user's alive score.
    async fn alive_score(&self, user: UserId) -> Result<i64>;
}

/// One row of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub user_id: UserId,
    pub username: String,
    #[serde(default)]
    pub alive_score: i64,
}

impl ReputationRecord {
    fn user_ref(&self) -> UserRef {
        UserRef {
            id: self.user_id,
            username: self.username.clone(),
        }
    }
}

/// Ledger stored in its own sled tree.
pub struct SledLedger {
    tree: Tree,
}

impl SledLedger {
    pub fn from_db(db: &Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(LEDGER_TREE)?,
        })
    }

    /// Registers a user on first sight. Returns `true` when the row was created.
    pub fn ensure_user(&self, user: &UserRef) -> Result<bool> {
        let row = ReputationRecord {
            user_id: user.id,
            username: user.username.clone(),
            alive_score: 0,
        };
        let created = self
            .tree
            .compare_and_swap(
                user.id.to_key(),
                None as Option<&[u8]>,
                Some(serde_json::to_vec(&row)?),
            )?
            .is_ok();
        if created {
            info!(target: "vigil::ledger", user_id = %user.id, username = %user.username, "user registered");
        }
        Ok(created)
    }

    /// Refreshes a user's display label. Returns `false` for unknown users.
    pub fn update_username(&self, user: UserId, username: &str) -> Result<bool> {
        let mut decode_err = None;
        let updated = self.tree.update_and_fetch(user.to_key(), |old| {
            let bytes = old?;
            match serde_json::from_slice::<ReputationRecord>(bytes) {
                Ok(mut row) => {
                    row.username = username.to_string();
                    serde_json::to_vec(&row).ok().or_else(|| Some(bytes.to_vec()))
                }
                Err(e) => {
                    decode_err = Some(e);
                    Some(bytes.to_vec())
                }
            }
        })?;
        if let Some(e) = decode_err {
            return Err(e.into());
        }
        Ok(updated.is_some())
    }

    pub fn get(&self, user: UserId) -> Result<Option<ReputationRecord>> {
        match self.tree.get(user.to_key())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ReputationLedger for SledLedger {
    async fn list_all_users(&self) -> Result<Vec<UserRef>> {
        self.tree
            .iter()
            .values()
            .map(|v| -> Result<UserRef> {
                let row: ReputationRecord = serde_json::from_slice(&v?)?;
                Ok(row.user_ref())
            })
            .collect()
    }

    async fn add_points(&self, user: UserId, amount: i64) -> Result<()> {
        let mut decode_err = None;
        let updated = self.tree.update_and_fetch(user.to_key(), |old| {
            let bytes = old?;
            match serde_json::from_slice::<ReputationRecord>(bytes) {
                Ok(mut row) => {
                    row.alive_score = row.alive_score.saturating_add(amount);
                    serde_json::to_vec(&row).ok().or_else(|| Some(bytes.to_vec()))
                }
                Err(e) => {
                    decode_err = Some(e);
                    Some(bytes.to_vec())
                }
            }
        })?;
        if let Some(e) = decode_err {
            return Err(VigilError::Ledger(format!("corrupt row for user {user}: {e}")));
        }
        if updated.is_none() {
            return Err(VigilError::UnknownUser(user));
        }
        debug!(target: "vigil::ledger", user_id = %user, amount, "points added");
        Ok(())
    }

    async fn alive_score(&self, user: UserId) -> Result<i64> {
        self.get(user)?
            .map(|row| row.alive_score)
            .ok_or(VigilError::UnknownUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, SledLedger) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("ledger")).unwrap();
        (dir, SledLedger::from_db(&db).unwrap())
    }

    #[tokio::test]
    async fn ensure_user_is_idempotent_and_listed() {
        let (_dir, ledger) = open();
        assert!(ledger.ensure_user(&UserRef::new(3, "cy")).unwrap());
        assert!(!ledger.ensure_user(&UserRef::new(3, "cy")).unwrap());
        assert!(ledger.ensure_user(&UserRef::new(1, "al")).unwrap());

        let users = ledger.list_all_users().await.unwrap();
        assert_eq!(users, vec![UserRef::new(1, "al"), UserRef::new(3, "cy")]);
    }

    #[tokio::test]
    async fn add_points_accumulates_and_rejects_unknown_users() {
        let (_dir, ledger) = open();
        ledger.ensure_user(&UserRef::new(5, "eve")).unwrap();
        ledger.add_points(UserId(5), 2).await.unwrap();
        ledger.add_points(UserId(5), 3).await.unwrap();
        assert_eq!(ledger.alive_score(UserId(5)).await.unwrap(), 5);

        let err = ledger.add_points(UserId(6), 1).await.unwrap_err();
        assert!(matches!(err, VigilError::UnknownUser(UserId(6))));
        assert!(ledger.get(UserId(6)).unwrap().is_none());
    }

    #[tokio::test]
    async fn username_refresh_keeps_score() {
        let (_dir, ledger) = open();
        ledger.ensure_user(&UserRef::new(8, "old")).unwrap();
        ledger.add_points(UserId(8), 4).await.unwrap();

        assert!(ledger.update_username(UserId(8), "new").unwrap());
        assert!(!ledger.update_username(UserId(9), "ghost").unwrap());

        let row = ledger.get(UserId(8)).unwrap().unwrap();
        assert_eq!(row.username, "new");
        assert_eq!(row.alive_score, 4);
    }
}
