use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{ChatError, ChatResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub voice_url: Option<String>,
    pub user_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub reactions: Vec<ReactionSummary>,
    #[serde(default, rename = "profiles")]
    pub profile: Option<AuthorProfile>,
}

impl Message {
    pub fn is_voice(&self) -> bool {
        self.voice_url.is_some()
    }

    /// Name shown next to the bubble: full name, else the local part of the email.
    pub fn author_name(&self) -> &str {
        let Some(profile) = &self.profile else {
            return "User";
        };
        if let Some(name) = profile.full_name.as_deref().filter(|n| !n.is_empty()) {
            return name;
        }
        profile
            .email
            .as_deref()
            .and_then(|email| email.split('@').next())
            .unwrap_or("User")
    }
}

/// Author fields denormalized onto a message by the store's join.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorProfile {
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionSummary {
    pub emoji: String,
    pub count: u32,
    pub user_has_reacted: bool,
}

/// Folds `(emoji, user_id)` rows into per-emoji summaries, in first-seen order.
pub fn summarize_reactions<'a>(
    rows: impl IntoIterator<Item = (&'a str, &'a str)>,
    viewer: Option<&str>,
) -> Vec<ReactionSummary> {
    let mut summaries: Vec<ReactionSummary> = Vec::new();
    for (emoji, user_id) in rows {
        let mine = viewer == Some(user_id);
        match summaries.iter_mut().find(|s| s.emoji == emoji) {
            Some(summary) => {
                summary.count += 1;
                summary.user_has_reacted |= mine;
            }
            None => summaries.push(ReactionSummary {
                emoji: emoji.to_owned(),
                count: 1,
                user_has_reacted: mine,
            }),
        }
    }
    summaries
}

/// A message row about to be inserted. Carries text or audio, never neither.
#[derive(Debug, Clone, Serialize)]
pub struct NewMessage {
    pub user_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_url: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub created_at: Option<OffsetDateTime>,
}

impl NewMessage {
    pub fn text(user_id: impl Into<String>, content: impl Into<String>) -> ChatResult<Self> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        Ok(Self {
            user_id: user_id.into(),
            content,
            voice_url: None,
            created_at: None,
        })
    }

    pub fn voice(user_id: impl Into<String>, voice_url: impl Into<String>) -> ChatResult<Self> {
        let voice_url = voice_url.into();
        if voice_url.is_empty() {
            return Err(ChatError::EmptyRecording);
        }
        Ok(Self {
            user_id: user_id.into(),
            content: String::new(),
            voice_url: Some(voice_url),
            created_at: None,
        })
    }

    /// Pins the creation time instead of letting the store stamp it.
    pub fn at(mut self, created_at: OffsetDateTime) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessagePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_pinned: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_edited: Option<bool>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub updated_at: Option<OffsetDateTime>,
}

impl MessagePatch {
    pub fn edit(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            is_edited: Some(true),
            updated_at: Some(OffsetDateTime::now_utc()),
            ..Default::default()
        }
    }

    pub fn pin(is_pinned: bool) -> Self {
        Self {
            is_pinned: Some(is_pinned),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Filter, order and limit for a message fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageQuery {
    pub order: SortOrder,
    pub limit: Option<u32>,
    pub pinned_only: bool,
    /// Only messages created strictly before this instant.
    pub before: Option<OffsetDateTime>,
}

impl MessageQuery {
    pub fn all() -> Self {
        Self::default()
    }

    /// Up to `size` messages older than `before` (or the newest ones), newest first.
    pub fn page(before: Option<OffsetDateTime>, size: u32) -> Self {
        Self {
            order: SortOrder::Descending,
            limit: Some(size),
            before,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub bubble_style: Option<String>,
    #[serde(default)]
    pub primary_color: Option<String>,
    #[serde(default)]
    pub message_alignment: Option<String>,
    #[serde(default)]
    pub enable_sounds: Option<bool>,
    #[serde(default)]
    pub show_timestamps: Option<bool>,
    #[serde(default)]
    pub show_read_receipts: Option<bool>,
    #[serde(default)]
    pub enable_notifications: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bubble_style: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_alignment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_sounds: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_timestamps: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_read_receipts: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_notifications: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// A new account; `full_name` seeds the profile.
#[derive(Debug, Clone, Deserialize)]
pub struct SignUp {
    pub email: String,
    pub password: String,
    pub full_name: String,
}

pub const REPORT_PENDING: &str = "pending";

/// A user's complaint about a message, queued for moderation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewReport {
    pub message_id: String,
    pub reporter_id: String,
    pub reason: String,
    pub status: &'static str,
}

impl NewReport {
    pub fn new(
        message_id: impl Into<String>,
        reporter_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            reporter_id: reporter_id.into(),
            reason: reason.into(),
            status: REPORT_PENDING,
        }
    }
}

/// Recorded audio ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBlob {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl AudioBlob {
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// File extension for the blob's encoded format; codec parameters are ignored.
    pub fn extension(&self) -> &'static str {
        let essence = self
            .content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "audio/webm" => "webm",
            "audio/ogg" => "ogg",
            "audio/mp4" => "m4a",
            "audio/mpeg" => "mp3",
            "audio/wav" | "audio/x-wav" => "wav",
            _ => "bin",
        }
    }
}

/// A stored object fetched back from a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Messages,
    Profiles,
    MessageReactions,
    MessageReports,
}

impl Table {
    pub fn name(&self) -> &'static str {
        use Table::*;
        match self {
            Messages => "messages",
            Profiles => "profiles",
            MessageReactions => "message_reactions",
            MessageReports => "message_reports",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        use Table::*;
        [Messages, Profiles, MessageReactions, MessageReports]
            .into_iter()
            .find(|table| table.name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// The subscriber fell behind and missed events.
    Resync,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub id: Option<String>,
}
