//! Error type shared by every vigil-core component.

use crate::model::UserId;

/// Top-level error for the activity-check core.
#[derive(Debug, thiserror::Error)]
pub enum VigilError {
    /// Sled storage failure (liveness store or ledger tree).
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// A persisted value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Config sources could not be read or deserialized.
    #[error("config load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// Config was readable but is not usable (fatal at start-up).
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The sweep schedule expression did not parse.
    #[error("invalid schedule `{expr}`: {reason}")]
    InvalidSchedule { expr: String, reason: String },

    /// Chat transport refused or failed a request.
    #[error("notifier error: {0}")]
    Notifier(String),

    /// Reputation ledger failure.
    #[error("ledger error: {0}")]
    Ledger(String),

    /// The ledger has no entry for this user.
    #[error("unknown user {0}")]
    UnknownUser(UserId),

    /// The store or scheduler was stopped; late callbacks land here instead of panicking.
    #[error("component is shut down")]
    ShutDown,
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VigilError>;
