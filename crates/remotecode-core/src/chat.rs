//! Transport-neutral chat types and the `ChatApi` seam.
//!
//! The orchestrator, watcher, and scanner talk to the chat service only
//! through [`ChatApi`]. The Telegram adapter implements it with teloxide;
//! tests implement it with an in-memory recorder.

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ChatId, MessageId};

/// Hard cap on an outgoing message body. Telegram rejects anything over 4096
/// characters; we truncate rather than split because a streamed turn already
/// arrives as several messages.
pub const BODY_MAX: usize = 4096;

const TRUNCATION_MARKER: &str = "\n[truncated]";

/// One inline-keyboard button: visible label + opaque callback payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub data: String,
}

impl Button {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// Rows of inline-keyboard buttons.
pub type Keyboard = Vec<Vec<Button>>;

/// An outgoing chat message, before transport-specific encoding.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub text: String,
    pub reply_to: Option<MessageId>,
    pub keyboard: Option<Keyboard>,
    /// Render with rich-text markup. The transport falls back to plain text
    /// when the markup is rejected.
    pub markdown: bool,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: truncate_body(text.into()),
            ..Default::default()
        }
    }

    pub fn markdown(text: impl Into<String>) -> Self {
        Self {
            text: truncate_body(text.into()),
            markdown: true,
            ..Default::default()
        }
    }

    pub fn reply_to(mut self, id: Option<MessageId>) -> Self {
        self.reply_to = id;
        self
    }

    pub fn with_keyboard(mut self, keyboard: Keyboard) -> Self {
        self.keyboard = Some(keyboard);
        self
    }
}

/// Enforce [`BODY_MAX`], appending a `[truncated]` marker on overflow.
pub fn truncate_body(text: String) -> String {
    if text.chars().count() <= BODY_MAX {
        return text;
    }
    let keep = BODY_MAX - TRUNCATION_MARKER.chars().count();
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

/// The subset of the chat service the core consumes. Long-polling itself
/// lives in the adapter; the core only sends, edits, and deletes.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send(&self, chat: ChatId, msg: OutgoingMessage) -> Result<MessageId>;

    async fn edit(&self, chat: ChatId, id: MessageId, msg: OutgoingMessage) -> Result<()>;

    async fn delete(&self, chat: ChatId, id: MessageId) -> Result<()>;

    /// Acknowledge an inline-keyboard callback, optionally with a toast.
    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()>;

    /// Fire one "typing" chat action. Callers refresh on their own cadence.
    async fn typing(&self, chat: ChatId) -> Result<()>;

    /// Register the bot command menu.
    async fn set_commands(&self, commands: &[(String, String)]) -> Result<()>;

    /// Download a transport file (photo, voice note) to `dest`.
    async fn download_file(&self, file_id: &str, dest: &Path) -> Result<()>;
}

/// Incoming chat traffic, already allowlist-filtered by the adapter.
#[derive(Debug, Clone)]
pub enum ChatUpdate {
    Text {
        chat: ChatId,
        message_id: MessageId,
        text: String,
    },
    Photo {
        chat: ChatId,
        message_id: MessageId,
        file_id: String,
        caption: String,
    },
    Voice {
        chat: ChatId,
        message_id: MessageId,
        file_id: String,
    },
    Callback {
        chat: ChatId,
        /// Message the keyboard was attached to.
        message_id: MessageId,
        callback_id: String,
        data: String,
    },
}

impl ChatUpdate {
    pub fn chat(&self) -> ChatId {
        match self {
            ChatUpdate::Text { chat, .. }
            | ChatUpdate::Photo { chat, .. }
            | ChatUpdate::Voice { chat, .. }
            | ChatUpdate::Callback { chat, .. } => *chat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_body_untouched() {
        assert_eq!(truncate_body("hello".into()), "hello");
    }

    #[test]
    fn body_at_limit_untouched() {
        let body = "a".repeat(BODY_MAX);
        assert_eq!(truncate_body(body.clone()), body);
    }

    #[test]
    fn over_limit_body_gains_marker_and_fits() {
        let body = "a".repeat(BODY_MAX + 500);
        let out = truncate_body(body);
        assert!(out.ends_with("[truncated]"));
        assert!(out.chars().count() <= BODY_MAX);
    }

    #[test]
    fn truncation_counts_chars_not_bytes() {
        let body = "é".repeat(BODY_MAX + 10);
        let out = truncate_body(body);
        assert!(out.chars().count() <= BODY_MAX);
        assert!(out.ends_with("[truncated]"));
    }
}
