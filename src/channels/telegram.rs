//! Telegram transport: long-polls the Bot API for updates.
//!
//! Text goes out through `sendMessage`, media through `copyMessage` with a
//! caption override so the original file is reused without a download.
//! The Bot API has no history endpoint, so channel/group posts from chats an
//! active history task reads are journaled in the store as they arrive on the
//! update stream, and `iter_history` pages that journal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::channels::transport::{MessageStream, Transport};
use crate::error::ChannelError;
use crate::pipeline::matcher::{canonical_identifier, source_matches};
use crate::pipeline::types::{ChannelRef, InboundMessage, Media, MediaKind};
use crate::store::Database;
use crate::tasks::model::{Task, TaskMode};

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Maximum caption length for media messages.
const TELEGRAM_MAX_CAPTION_LENGTH: usize = 1024;

/// Long-poll timeout passed to getUpdates.
const POLL_TIMEOUT_SECS: u64 = 30;

const NAME: &str = "telegram";

/// Telegram transport. Connects to the Bot API via long-polling.
pub struct TelegramTransport {
    bot_token: SecretString,
    client: reqwest::Client,
    store: Arc<dyn Database>,
}

impl TelegramTransport {
    pub fn new(bot_token: SecretString, store: Arc<dyn Database>) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
            store,
        }
    }

    fn api_url(&self, method: &str) -> String {
        api_url(&self.bot_token, method)
    }

    /// POST a Bot API method and unwrap its `result`.
    async fn call(&self, method: &str, body: &Value) -> Result<Value, ChannelError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::Http(format!("{method}: {}", e.without_url())))?;

        let data: Value = resp
            .json()
            .await
            .map_err(|e| ChannelError::InvalidMessage(format!("{method}: {e}")))?;

        parse_api_response(method, data)
    }

    /// Send a text message, split into chunks ≤4096 chars.
    /// Returns the ID of the first chunk.
    async fn send_text(&self, chat_id: &Value, text: &str) -> Result<i64, ChannelError> {
        if text.trim().is_empty() {
            return Err(ChannelError::InvalidMessage("empty message text".into()));
        }

        let mut first_id = None;
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            let result = self
                .call(
                    "sendMessage",
                    &serde_json::json!({
                        "chat_id": chat_id,
                        "text": chunk,
                        "disable_web_page_preview": true,
                    }),
                )
                .await?;
            let id = message_id(&result)?;
            first_id.get_or_insert(id);
        }

        first_id.ok_or_else(|| ChannelError::InvalidMessage("nothing sent".into()))
    }

    /// Copy a media message with a new caption.
    async fn copy_media(&self, chat_id: &Value, media: &Media, caption: &str) -> Result<i64, ChannelError> {
        let result = self
            .call(
                "copyMessage",
                &serde_json::json!({
                    "chat_id": chat_id,
                    "from_chat_id": media.origin_chat_id,
                    "message_id": media.origin_message_id,
                    "caption": caption,
                }),
            )
            .await?;
        message_id(&result)
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    fn name(&self) -> &str {
        NAME
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let url = self.api_url("getUpdates");
        let client = self.client.clone();
        let store = Arc::clone(&self.store);

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram transport listening for updates...");

            loop {
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": POLL_TIMEOUT_SECS,
                    "allowed_updates": ["message", "channel_post"]
                });

                let resp = match client
                    .post(&url)
                    .json(&body)
                    .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
                    .send()
                    .await
                {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {}", e.without_url());
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let data: Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Telegram parse error: {e}");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let results = match parse_api_response("getUpdates", data) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll rejected: {e}");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                // History tasks, loaded once per batch on the first channel post.
                let mut history_tasks: Option<Vec<Task>> = None;

                for update in results.as_array().into_iter().flatten() {
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = uid + 1;
                    }

                    let Some(raw) = update.get("channel_post").or_else(|| update.get("message"))
                    else {
                        continue;
                    };
                    let Some(message) = parse_message(raw) else {
                        continue;
                    };

                    if !is_private_chat(raw) {
                        if history_tasks.is_none() {
                            history_tasks = Some(
                                store
                                    .list_active_tasks(TaskMode::History)
                                    .await
                                    .unwrap_or_else(|e| {
                                        tracing::warn!("Failed to load history tasks: {e}");
                                        Vec::new()
                                    }),
                            );
                        }
                        let watched = history_tasks.as_deref().unwrap_or_default();
                        if is_watched(watched, &message) {
                            if let Err(e) = store.record_channel_message(&message).await {
                                tracing::warn!(
                                    message_id = message.id,
                                    "Failed to journal message: {e}"
                                );
                            }
                        }
                    }

                    if tx.send(message).is_err() {
                        tracing::info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn send_message(
        &self,
        target: &str,
        text: &str,
        media: Option<&Media>,
    ) -> Result<i64, ChannelError> {
        let chat_id = chat_id_value(target);

        let Some(media) = media else {
            return self.send_text(&chat_id, text).await;
        };

        if text.chars().count() <= TELEGRAM_MAX_CAPTION_LENGTH {
            return self.copy_media(&chat_id, media, text).await;
        }

        // Caption too long: media first, then the body as its own message.
        let id = self.copy_media(&chat_id, media, "").await?;
        self.send_text(&chat_id, text).await?;
        Ok(id)
    }

    async fn resolve_channel(&self, identifier: &str) -> Result<ChannelRef, ChannelError> {
        let result = self
            .call(
                "getChat",
                &serde_json::json!({ "chat_id": chat_id_value(identifier) }),
            )
            .await
            .map_err(|e| match e {
                ChannelError::SendFailed { reason, .. } => ChannelError::ResolveFailed {
                    name: NAME.into(),
                    identifier: identifier.to_string(),
                    reason,
                },
                other => other,
            })?;

        parse_chat(&result).ok_or_else(|| ChannelError::ResolveFailed {
            name: NAME.into(),
            identifier: identifier.to_string(),
            reason: "getChat returned no chat id".into(),
        })
    }

    async fn iter_history(
        &self,
        source: &ChannelRef,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, ChannelError> {
        self.store
            .list_channel_messages(source.id, after_id, limit)
            .await
            .map_err(|e| ChannelError::HistoryUnavailable {
                name: NAME.into(),
                reason: e.to_string(),
            })
    }

    async fn join_channel(&self, identifier: &str) -> Result<bool, ChannelError> {
        // Bots cannot join on their own; report whether the chat is visible.
        match self.resolve_channel(identifier).await {
            Ok(_) => Ok(true),
            Err(ChannelError::ResolveFailed { reason, .. }) => {
                tracing::warn!(identifier, "Chat not reachable by the bot: {reason}");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        let me = self
            .call("getMe", &serde_json::json!({}))
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: NAME.into(),
                reason: e.to_string(),
            })?;

        let bot = me
            .get("username")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        tracing::info!(bot, "Telegram bot authenticated");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        tracing::info!("Telegram transport shutting down");
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn api_url(token: &SecretString, method: &str) -> String {
    format!("https://api.telegram.org/bot{}/{method}", token.expose_secret())
}

/// Unwrap a Bot API envelope: `{"ok": true, "result": ...}`.
fn parse_api_response(method: &str, data: Value) -> Result<Value, ChannelError> {
    if data.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(data.get("result").cloned().unwrap_or(Value::Null));
    }

    let code = data.get("error_code").and_then(Value::as_i64);
    if code == Some(429) {
        let retry_after = data
            .get("parameters")
            .and_then(|p| p.get("retry_after"))
            .and_then(Value::as_u64)
            .map(Duration::from_secs);
        return Err(ChannelError::RateLimited {
            name: NAME.into(),
            retry_after,
        });
    }

    let description = data
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    Err(ChannelError::SendFailed {
        name: NAME.into(),
        reason: format!("{method}: {description}"),
    })
}

fn message_id(result: &Value) -> Result<i64, ChannelError> {
    result
        .get("message_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| ChannelError::InvalidMessage("response has no message_id".into()))
}

/// Bot API `chat_id` for an operator-supplied identifier.
///
/// Numeric IDs stay numbers; `t.me/name` links and bare names become `@name`.
fn chat_id_value(identifier: &str) -> Value {
    let canonical = canonical_identifier(identifier);
    match canonical.parse::<i64>() {
        Ok(id) => Value::from(id),
        Err(_) => Value::from(canonical),
    }
}

/// Whether an active history task reads the message's chat. Only those
/// posts are journaled.
fn is_watched(history_tasks: &[Task], message: &InboundMessage) -> bool {
    message.chat.as_ref().is_some_and(|chat| {
        history_tasks
            .iter()
            .any(|task| source_matches(&task.source_id, chat).is_match())
    })
}

fn is_private_chat(message: &Value) -> bool {
    message
        .get("chat")
        .and_then(|c| c.get("type"))
        .and_then(Value::as_str)
        == Some("private")
}

fn parse_chat(chat: &Value) -> Option<ChannelRef> {
    let id = chat.get("id").and_then(Value::as_i64)?;
    let title = chat
        .get("title")
        .or_else(|| chat.get("first_name"))
        .and_then(Value::as_str)
        .map(String::from);
    Some(ChannelRef {
        id,
        username: chat.get("username").and_then(Value::as_str).map(String::from),
        title,
    })
}

fn parse_media(message: &Value, chat_id: i64, message_id: i64) -> Option<Media> {
    // `animation` messages also carry `document`, so check it first.
    const KINDS: &[(&str, MediaKind)] = &[
        ("photo", MediaKind::Photo),
        ("video", MediaKind::Video),
        ("animation", MediaKind::Animation),
        ("document", MediaKind::Document),
        ("audio", MediaKind::Audio),
        ("voice", MediaKind::Voice),
        ("sticker", MediaKind::Sticker),
        ("video_note", MediaKind::Other),
    ];

    KINDS.iter().find_map(|(key, kind)| {
        let field = message.get(*key)?;
        // Photos come as an array of sizes; the last one is the largest.
        let file = match field.as_array() {
            Some(sizes) => sizes.last()?,
            None => field,
        };
        Some(Media {
            kind: *kind,
            file_id: file.get("file_id").and_then(Value::as_str)?.to_string(),
            origin_chat_id: chat_id,
            origin_message_id: message_id,
        })
    })
}

/// Convert a Bot API `Message` object. `None` for service messages.
fn parse_message(message: &Value) -> Option<InboundMessage> {
    let id = message.get("message_id").and_then(Value::as_i64)?;
    let chat = message.get("chat").and_then(parse_chat);

    let text = message
        .get("text")
        .or_else(|| message.get("caption"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let media = chat
        .as_ref()
        .and_then(|c| parse_media(message, c.id, id));

    if text.is_empty() && media.is_none() {
        return None;
    }

    let date = message
        .get("date")
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    Some(InboundMessage {
        id,
        chat,
        text,
        media,
        sender_id: message
            .get("from")
            .and_then(|f| f.get("id"))
            .and_then(Value::as_i64),
        date,
    })
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts on a char boundary.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let Some((limit, _)) = remaining.char_indices().nth(max_chars) else {
            chunks.push(remaining.to_string());
            break;
        };

        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
