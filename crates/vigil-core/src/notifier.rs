//! Chat transport seam and the alert/warning channel helper.

use crate::error::Result;
use crate::model::{ChatId, MessageRef, UserId};
use async_trait::async_trait;
use tracing::warn;

/// Callback payload prefix carried by the "I'm alive" control.
pub const ALIVE_CALLBACK_PREFIX: &str = "alive_";

/// An actionable control attached to a challenge (an inline button on Telegram).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseControl {
    pub label: String,
    /// Opaque data echoed back by the transport when the control is used.
    pub payload: String,
}

impl ResponseControl {
    /// The challenge control, tagged with the challenged user's id.
    pub fn alive(user: UserId, label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            payload: format!("{ALIVE_CALLBACK_PREFIX}{user}"),
        }
    }
}

/// Extracts the tagged user id from an alive-control payload.
pub fn parse_alive_payload(payload: &str) -> Option<UserId> {
    payload
        .strip_prefix(ALIVE_CALLBACK_PREFIX)?
        .trim()
        .parse::<i64>()
        .ok()
        .map(UserId)
}

/// Best-effort chat transport. The core never retries a failed call.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends `text` to `chat`, optionally with a response control.
    async fn send(
        &self,
        chat: ChatId,
        text: &str,
        control: Option<&ResponseControl>,
    ) -> Result<MessageRef>;

    /// Clears the transport's pending state for a used control (e.g. button spinner).
    async fn acknowledge(&self, control_ref: &str) -> Result<()>;

    /// Replaces the text of a previously sent message.
    async fn edit(&self, message: MessageRef, text: &str) -> Result<()>;
}

/// Posts plain-text status lines to the configured alert and warning destinations.
/// Delivery failures are logged and swallowed.
#[derive(Debug, Clone, Copy)]
pub struct AlertChannels {
    pub alerts: ChatId,
    pub warnings: ChatId,
}

impl AlertChannels {
    pub async fn alert(&self, notifier: &dyn Notifier, text: &str) {
        if let Err(e) = notifier.send(self.alerts, text, None).await {
            warn!(target: "vigil::alerts", chat = %self.alerts, error = %e, "alert delivery failed");
        }
    }

    pub async fn warning(&self, notifier: &dyn Notifier, text: &str) {
        if let Err(e) = notifier.send(self.warnings, text, None).await {
            warn!(target: "vigil::alerts", chat = %self.warnings, error = %e, "warning delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alive_payload_round_trips_user_id() {
        let control = ResponseControl::alive(UserId(42), "yes");
        assert_eq!(control.payload, "alive_42");
        assert_eq!(parse_alive_payload(&control.payload), Some(UserId(42)));
    }

    #[test]
    fn foreign_payloads_are_rejected() {
        assert_eq!(parse_alive_payload("vote_42"), None);
        assert_eq!(parse_alive_payload("alive_"), None);
        assert_eq!(parse_alive_payload("alive_abc"), None);
    }
}
