//! Inbound side: long-polls Telegram, keeps the user directory current, and hands
//! "I'm alive" button presses to the engine.

use crate::telegram::{TelegramApi, TgUpdate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vigil_core::{
    parse_alive_payload, InboundResponse, LivenessEngine, LivenessStore, Notifier, SledLedger,
    UserRef, ALIVE_CALLBACK_PREFIX,
};

const ERROR_BACKOFF: Duration = Duration::from_secs(3);

/// What one update means for the activity check.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// A user wrote something; register or refresh them.
    Seen(UserRef),
    /// The challenged user pressed their own alive button.
    Alive(InboundResponse),
    /// A callback we must answer but not act on (someone else's button, other bots' data).
    Dismiss { callback_id: String },
    Ignore,
}

pub fn route(update: &TgUpdate) -> Routed {
    if let Some(query) = &update.callback_query {
        let data = query.data.as_deref().unwrap_or_default();
        if !data.starts_with(ALIVE_CALLBACK_PREFIX) {
            return Routed::Dismiss {
                callback_id: query.id.clone(),
            };
        }
        let presser = query.from.user_ref();
        return match parse_alive_payload(data) {
            Some(target) if target == presser.id => Routed::Alive(InboundResponse {
                user: presser,
                control_ref: Some(query.id.clone()),
                message: query.message.as_ref().map(|m| m.message_ref()),
            }),
            _ => Routed::Dismiss {
                callback_id: query.id.clone(),
            },
        };
    }
    match update.message.as_ref().and_then(|m| m.from.as_ref()) {
        Some(from) => Routed::Seen(from.user_ref()),
        None => Routed::Ignore,
    }
}

pub struct UpdatePoller {
    api: Arc<TelegramApi>,
    engine: Arc<LivenessEngine>,
    ledger: Arc<SledLedger>,
    store: Arc<LivenessStore>,
}

impl UpdatePoller {
    pub fn new(
        api: Arc<TelegramApi>,
        engine: Arc<LivenessEngine>,
        ledger: Arc<SledLedger>,
        store: Arc<LivenessStore>,
    ) -> Self {
        Self {
            api,
            engine,
            ledger,
            store,
        }
    }

    /// Polls until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut offset = 0_i64;
        info!(target: "vigil::poller", "update poller started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let batch = tokio::select! {
                batch = self.api.get_updates(offset) => batch,
                _ = shutdown.changed() => break,
            };
            match batch {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        self.dispatch(route(&update)).await;
                    }
                }
                Err(e) => {
                    warn!(target: "vigil::poller", error = %e, "getUpdates failed; backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        info!(target: "vigil::poller", "update poller stopped");
    }

    async fn dispatch(&self, routed: Routed) {
        match routed {
            Routed::Seen(user) => self.register(&user).await,
            Routed::Alive(response) => {
                match self.engine.handle_response(&response).await {
                    Ok(outcome) => {
                        debug!(target: "vigil::poller", user_id = %response.user.id, ?outcome, "alive response handled")
                    }
                    Err(e) => {
                        warn!(target: "vigil::poller", user_id = %response.user.id, error = %e, "alive response failed")
                    }
                }
            }
            Routed::Dismiss { callback_id } => {
                if let Err(e) = self.api.acknowledge(&callback_id).await {
                    debug!(target: "vigil::poller", error = %e, "dismiss failed");
                }
            }
            Routed::Ignore => {}
        }
    }

    /// First sight adds the user to the directory; later messages refresh the label.
    async fn register(&self, user: &UserRef) {
        match self.ledger.ensure_user(user) {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = self.ledger.update_username(user.id, &user.username) {
                    warn!(target: "vigil::poller", user_id = %user.id, error = %e, "ledger username refresh failed");
                }
                if let Err(e) = self.store.update_username(user.id, &user.username).await {
                    debug!(target: "vigil::poller", user_id = %user.id, error = %e, "liveness username refresh failed");
                }
            }
            Err(e) => {
                warn!(target: "vigil::poller", user_id = %user.id, error = %e, "user registration failed")
            }
        }
    }
}
