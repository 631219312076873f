//! Telegram Bot API client: the production [`Notifier`] plus `getUpdates` long polling.
//!
//! Only the handful of methods the activity check needs are wrapped. Every call goes
//! through [`TelegramApi::call`], which unwraps Telegram's `{ ok, result, description }`
//! envelope into a `VigilError::Notifier` on failure.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use vigil_core::{ChatId, MessageRef, Notifier, ResponseControl, Result, UserRef, VigilError};

const API_BASE: &str = "https://api.telegram.org";
/// Seconds Telegram may hold a `getUpdates` request open.
pub const LONG_POLL_SECS: u64 = 25;
/// HTTP timeout; must exceed the long-poll window.
const HTTP_TIMEOUT_SECS: u64 = LONG_POLL_SECS + 15;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: String,
}

impl TgUser {
    /// `@handle` when set, otherwise the first name.
    pub fn user_ref(&self) -> UserRef {
        let label = self
            .username
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(&self.first_name);
        UserRef::new(self.id, label)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgChat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgMessage {
    pub message_id: i64,
    pub chat: TgChat,
    #[serde(default)]
    pub from: Option<TgUser>,
}

impl TgMessage {
    pub fn message_ref(&self) -> MessageRef {
        MessageRef {
            chat_id: ChatId(self.chat.id),
            message_id: self.message_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgCallbackQuery {
    pub id: String,
    pub from: TgUser,
    #[serde(default)]
    pub message: Option<TgMessage>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TgMessage>,
    #[serde(default)]
    pub callback_query: Option<TgCallbackQuery>,
}

#[derive(Debug, Serialize)]
struct InlineButton<'a> {
    text: &'a str,
    callback_data: &'a str,
}

#[derive(Debug, Serialize)]
struct InlineKeyboard<'a> {
    inline_keyboard: Vec<Vec<InlineButton<'a>>>,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<InlineKeyboard<'a>>,
}

#[derive(Debug, Serialize)]
struct EditMessageText<'a> {
    chat_id: i64,
    message_id: i64,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct AnswerCallbackQuery<'a> {
    callback_query_id: &'a str,
}

#[derive(Debug, Serialize)]
struct GetUpdates {
    offset: i64,
    timeout: u64,
    allowed_updates: [&'static str; 2],
}

/// Thin Bot API client.
pub struct TelegramApi {
    client: reqwest::Client,
    base: String,
}

impl TelegramApi {
    pub fn new(token: &str) -> Result<Self> {
        Self::with_base_url(API_BASE, token)
    }

    /// Client against a non-default API host (local Bot API server, tests).
    pub fn with_base_url(api_base: &str, token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| VigilError::Notifier(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base: format!("{}/bot{}", api_base.trim_end_matches('/'), token),
        })
    }

    async fn call<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .client
            .post(format!("{}/{method}", self.base))
            .json(body)
            .send()
            .await
            // without_url keeps the token out of logs
            .map_err(|e| VigilError::Notifier(format!("{method}: {}", e.without_url())))?;
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| VigilError::Notifier(format!("{method}: {}", e.without_url())))?;
        unwrap_envelope(method, envelope)
    }

    /// One long-poll round. Returns updates with `update_id >= offset`.
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<TgUpdate>> {
        self.call(
            "getUpdates",
            &GetUpdates {
                offset,
                timeout: LONG_POLL_SECS,
                allowed_updates: ["message", "callback_query"],
            },
        )
        .await
    }
}

fn unwrap_envelope<T>(method: &str, envelope: Envelope<T>) -> Result<T> {
    match envelope {
        Envelope {
            ok: true,
            result: Some(result),
            ..
        } => Ok(result),
        Envelope { description, .. } => Err(VigilError::Notifier(format!(
            "{method} rejected: {}",
            description.unwrap_or_else(|| "no description".into())
        ))),
    }
}

fn keyboard(control: &ResponseControl) -> InlineKeyboard<'_> {
    InlineKeyboard {
        inline_keyboard: vec![vec![InlineButton {
            text: &control.label,
            callback_data: &control.payload,
        }]],
    }
}

#[async_trait]
impl Notifier for TelegramApi {
    async fn send(
        &self,
        chat: ChatId,
        text: &str,
        control: Option<&ResponseControl>,
    ) -> Result<MessageRef> {
        let sent: TgMessage = self
            .call(
                "sendMessage",
                &SendMessage {
                    chat_id: chat.0,
                    text,
                    reply_markup: control.map(keyboard),
                },
            )
            .await?;
        Ok(sent.message_ref())
    }

    async fn acknowledge(&self, control_ref: &str) -> Result<()> {
        let _: bool = self
            .call(
                "answerCallbackQuery",
                &AnswerCallbackQuery {
                    callback_query_id: control_ref,
                },
            )
            .await?;
        Ok(())
    }

    async fn edit(&self, message: MessageRef, text: &str) -> Result<()> {
        // editMessageText answers with the edited Message (or `true` for inline messages)
        let _: serde_json::Value = self
            .call(
                "editMessageText",
                &EditMessageText {
                    chat_id: message.chat_id.0,
                    message_id: message.message_id,
                    text,
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::UserId;

    #[test]
    fn challenge_carries_inline_button() {
        let control = ResponseControl::alive(UserId(42), "yes");
        let body = serde_json::to_value(SendMessage {
            chat_id: 42,
            text: "alive?",
            reply_markup: Some(keyboard(&control)),
        })
        .unwrap();
        assert_eq!(
            body["reply_markup"]["inline_keyboard"][0][0]["callback_data"],
            "alive_42"
        );

        let plain = serde_json::to_value(SendMessage {
            chat_id: -100,
            text: "alert",
            reply_markup: None,
        })
        .unwrap();
        assert!(plain.get("reply_markup").is_none());
    }

    #[test]
    fn envelope_errors_surface_description() {
        let env: Envelope<TgMessage> =
            serde_json::from_str(r#"{"ok":false,"description":"Forbidden: bot was blocked by the user"}"#)
                .unwrap();
        let err = unwrap_envelope("sendMessage", env).unwrap_err();
        assert!(err.to_string().contains("blocked"));

        let env: Envelope<TgMessage> = serde_json::from_str(
            r#"{"ok":true,"result":{"message_id":9,"chat":{"id":42},"date":0}}"#,
        )
        .unwrap();
        let msg = unwrap_envelope("sendMessage", env).unwrap();
        assert_eq!(
            msg.message_ref(),
            MessageRef {
                chat_id: ChatId(42),
                message_id: 9
            }
        );
    }

    #[test]
    fn username_falls_back_to_first_name() {
        let with_handle: TgUser =
            serde_json::from_str(r#"{"id":1,"username":"ada","first_name":"Ada"}"#).unwrap();
        assert_eq!(with_handle.user_ref().username, "ada");
        let without: TgUser = serde_json::from_str(r#"{"id":2,"first_name":"Bob"}"#).unwrap();
        assert_eq!(without.user_ref(), UserRef::new(2, "Bob"));
    }
}
