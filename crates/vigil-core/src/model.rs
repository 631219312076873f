//! Liveness data model: per-user check state and the append-only response audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A timer may fire this much before its deadline (tokio's monotonic clock vs. UTC wall
/// clock) and still count as due.
pub const TIMER_SLACK_MS: i64 = 500;

/// Opaque, stable chat-platform user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl UserId {
    /// Big-endian key bytes; keeps sled iteration ordered by id.
    pub fn to_key(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque chat / channel identifier (a private chat with a user, or an alert channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

impl From<UserId> for ChatId {
    /// Private chats share the user's id on the supported transports.
    fn from(user: UserId) -> Self {
        ChatId(user.0)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user as known to the reputation ledger's directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: UserId,
    pub username: String,
}

impl UserRef {
    pub fn new(id: i64, username: impl Into<String>) -> Self {
        Self {
            id: UserId(id),
            username: username.into(),
        }
    }
}

/// Reference to a message the notifier delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: i64,
}

/// Observable state of a user's liveness check, derived from the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessState {
    /// A challenge is outstanding.
    AwaitingResponse,
    /// The most recent challenge was answered.
    Responded,
    /// Retries exhausted; waits for the next sweep.
    Inactive,
}

/// Durable per-user check state. One per user, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessRecord {
    pub user_id: UserId,
    /// Display label; may be refreshed independently of the check cycle.
    pub username: String,
    /// When the most recent challenge was issued.
    pub last_check_time: DateTime<Utc>,
    #[serde(default)]
    pub last_response_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    pub is_active: bool,
    /// Last challenge sent; cleared once a response resolves it.
    #[serde(default)]
    pub pending_message: Option<MessageRef>,
    /// Instant after which silence counts as a timeout.
    #[serde(default)]
    pub next_check_deadline: Option<DateTime<Utc>>,
}

impl LivenessRecord {
    /// Fresh record for a user seen for the first time.
    pub fn new(user: &UserRef, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user.id,
            username: user.username.clone(),
            last_check_time: now,
            last_response_time: None,
            retry_count: 0,
            is_active: true,
            pending_message: None,
            next_check_deadline: None,
        }
    }

    pub fn state(&self) -> LivenessState {
        if !self.is_active {
            LivenessState::Inactive
        } else if self.pending_message.is_some() {
            LivenessState::AwaitingResponse
        } else {
            LivenessState::Responded
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Staleness guard for timeout callbacks.
///
/// Timers are never cancelled, so a callback must prove it still owns the record before it
/// may touch `retry_count`. `armed_deadline` is the deadline the timer was armed for. The
/// callback is stale when the user is inactive, the challenge was already answered, a newer
/// challenge replaced the deadline, or the deadline has not actually passed yet.
pub fn is_timer_stale(
    record: &LivenessRecord,
    armed_deadline: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    if !record.is_active || record.pending_message.is_none() {
        return true;
    }
    if record.next_check_deadline != Some(armed_deadline) {
        return true;
    }
    now + chrono::Duration::milliseconds(TIMER_SLACK_MS) < armed_deadline
}

/// Immutable audit row appended once per confirmed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityCheckEvent {
    pub user_id: UserId,
    /// Username at the time of the response.
    pub username: String,
    pub checked_at: DateTime<Utc>,
    pub responded: bool,
    pub points: i64,
}
