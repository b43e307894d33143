//! Shared types for the forwarding pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Channels ────────────────────────────────────────────────────────

/// A resolved chat/channel as observed on the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    /// Network-native numeric ID (may carry the `-100` channel prefix).
    pub id: i64,
    /// Public username without the leading `@`.
    pub username: Option<String>,
    /// Display title.
    pub title: Option<String>,
}

impl ChannelRef {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            username: None,
            title: None,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Identifier to store on a task: `@username` when public, else the numeric ID.
    pub fn identifier(&self) -> String {
        match self.username.as_deref() {
            Some(u) if !u.is_empty() => format!("@{u}"),
            _ => self.id.to_string(),
        }
    }

    /// Best display name.
    pub fn display_name(&self) -> String {
        self.title.clone().unwrap_or_else(|| self.identifier())
    }
}

// ── Media ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Animation,
    Sticker,
    Other,
}

/// Opaque media attachment. Forwarded untouched, never inspected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub kind: MediaKind,
    /// Network file handle.
    pub file_id: String,
    /// Chat the media was originally posted in.
    pub origin_chat_id: i64,
    /// Message the media belongs to in the origin chat.
    pub origin_message_id: i64,
}

// ── Inbound message ─────────────────────────────────────────────────

/// A message received live or replayed from history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Per-chat message sequence number.
    pub id: i64,
    /// Originating chat. `None` when the transport could not resolve it.
    pub chat: Option<ChannelRef>,
    /// Text body or media caption.
    pub text: String,
    pub media: Option<Media>,
    /// Author, when the network exposes one.
    pub sender_id: Option<i64>,
    pub date: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(id: i64, chat: ChannelRef, text: impl Into<String>) -> Self {
        Self {
            id,
            chat: Some(chat),
            text: text.into(),
            media: None,
            sender_id: None,
            date: Utc::now(),
        }
    }

    pub fn with_media(mut self, media: Media) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_sender(mut self, sender_id: i64) -> Self {
        self.sender_id = Some(sender_id);
        self
    }
}

// ── Reports ─────────────────────────────────────────────────────────

/// Audit record emitted after every successful forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardReport {
    pub task_id: i64,
    pub source_title: String,
    pub target_title: String,
    pub message_id: i64,
    pub changes: Vec<String>,
}

impl ForwardReport {
    /// Render the report as plain text for the log channel.
    pub fn render(&self) -> String {
        let actions = if self.changes.is_empty() {
            "No changes.".to_string()
        } else {
            self.changes
                .iter()
                .map(|c| format!("- {c}"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "Forward Report\nTask: #{}\nSource: {}\nTarget: {}\nMsg ID: {}\n\nActions:\n{}",
            self.task_id, self.source_title, self.target_title, self.message_id, actions
        )
    }
}

// ── Outcomes ────────────────────────────────────────────────────────

/// What happened to one task for one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Sent; checkpoint advanced.
    Forwarded { task_id: i64, report: ForwardReport },
    /// A `SKIP_MESSAGE` rule fired.
    Skipped { task_id: i64, pattern: String },
    /// Rules left nothing to send and there is no media.
    Empty { task_id: i64 },
    /// Not forwarded because of an error. Send failures also bump the
    /// task's error count.
    Failed { task_id: i64, error: String },
    /// Task was deleted, paused or unreadable since lookup.
    Inactive { task_id: i64 },
}

impl TaskOutcome {
    pub fn task_id(&self) -> i64 {
        match self {
            Self::Forwarded { task_id, .. }
            | Self::Skipped { task_id, .. }
            | Self::Empty { task_id }
            | Self::Failed { task_id, .. }
            | Self::Inactive { task_id } => *task_id,
        }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Forwarded { .. } => "forwarded",
            Self::Skipped { .. } => "skipped",
            Self::Empty { .. } => "empty",
            Self::Failed { .. } => "failed",
            Self::Inactive { .. } => "inactive",
        }
    }
}
