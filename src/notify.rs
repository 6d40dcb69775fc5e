use std::fmt::Display;

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Success,
    Error,
}

/// A transient, non-blocking notification for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

/// Fan-out of notices to whoever is listening. Sending with no listeners is fine.
#[derive(Debug, Clone)]
pub struct Toasts {
    tx: broadcast::Sender<Notice>,
}

impl Toasts {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(64).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    pub fn success(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!("{text}");
        self.push(NoticeLevel::Success, text);
    }

    pub fn error(&self, text: impl Into<String>, cause: &dyn Display) {
        let text = text.into();
        tracing::warn!("{text}: {cause}");
        self.push(NoticeLevel::Error, text);
    }

    fn push(&self, level: NoticeLevel, text: String) {
        let _ = self.tx.send(Notice { level, text });
    }
}

impl Default for Toasts {
    fn default() -> Self {
        Self::new()
    }
}
