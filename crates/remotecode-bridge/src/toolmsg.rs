//! Per-turn rendering state.
//!
//! A turn produces at most one coalesced "tool message" in chat: every
//! non-silent tool_use appends a line. In yolo-like modes lines show
//! immediately; in interactive mode they stay hidden until the arbiter
//! reveals them just before its dialog. Reveals race new block arrivals, so
//! every mutation runs under the one edit lock.

use std::sync::Arc;

use tracing::debug;

use remotecode_core::chat::{ChatApi, OutgoingMessage};
use remotecode_core::types::{ChatId, MessageId};

#[derive(Debug)]
struct ToolLine {
    tool_use_id: Option<String>,
    tool_name: String,
    text: String,
    revealed: bool,
}

#[derive(Debug, Default)]
struct ToolMessageState {
    message_id: Option<MessageId>,
    lines: Vec<ToolLine>,
    status: Vec<String>,
}

/// The coalesced tool message for one turn.
pub struct ToolMessage {
    chat: ChatId,
    state: tokio::sync::Mutex<ToolMessageState>,
}

impl ToolMessage {
    pub fn new(chat: ChatId) -> Self {
        Self {
            chat,
            state: tokio::sync::Mutex::new(ToolMessageState::default()),
        }
    }

    /// Append a descriptor line. With `reveal` it becomes visible at once;
    /// otherwise it waits for [`ToolMessage::reveal`].
    pub async fn add_block(
        &self,
        api: &dyn ChatApi,
        tool_use_id: Option<String>,
        tool_name: &str,
        text: String,
        reveal: bool,
    ) {
        let mut state = self.state.lock().await;
        state.lines.push(ToolLine {
            tool_use_id,
            tool_name: tool_name.to_string(),
            text,
            revealed: reveal,
        });
        if reveal {
            self.render(api, &mut state).await;
        }
    }

    /// Reveal the line for `tool_use_id` (or, failing that, the first hidden
    /// line of `tool_name` — the Agent does not always correlate ids).
    pub async fn reveal(&self, api: &dyn ChatApi, tool_use_id: Option<&str>, tool_name: &str) {
        let mut state = self.state.lock().await;
        let index = tool_use_id
            .and_then(|id| {
                state
                    .lines
                    .iter()
                    .position(|l| l.tool_use_id.as_deref() == Some(id))
            })
            .or_else(|| {
                state
                    .lines
                    .iter()
                    .position(|l| !l.revealed && l.tool_name == tool_name)
            });
        if let Some(index) = index {
            if state.lines[index].revealed {
                return;
            }
            state.lines[index].revealed = true;
            self.render(api, &mut state).await;
        }
    }

    /// Append a status line (e.g. `✓ Allowed Bash`) under the descriptors.
    pub async fn append_status(&self, api: &dyn ChatApi, status: String) {
        let mut state = self.state.lock().await;
        state.status.push(status);
        self.render(api, &mut state).await;
    }

    pub async fn message_id(&self) -> Option<MessageId> {
        self.state.lock().await.message_id
    }

    /// Send or edit the chat message to match the revealed lines.
    async fn render(&self, api: &dyn ChatApi, state: &mut ToolMessageState) {
        let mut body: Vec<&str> = state
            .lines
            .iter()
            .filter(|l| l.revealed)
            .map(|l| l.text.as_str())
            .collect();
        body.extend(state.status.iter().map(String::as_str));
        if body.is_empty() {
            return;
        }
        let text = body.join("\n");
        match state.message_id {
            Some(id) => {
                if let Err(e) = api.edit(self.chat, id, OutgoingMessage::text(text)).await {
                    debug!(error = %e, "tool message edit failed");
                }
            }
            None => match api.send(self.chat, OutgoingMessage::text(text)).await {
                Ok(id) => state.message_id = Some(id),
                Err(e) => debug!(error = %e, "tool message send failed"),
            },
        }
    }
}

/// Everything the streaming loop and the arbiter share about the turn
/// currently rendering into a chat.
pub struct TurnUi {
    pub chat: ChatId,
    /// Render nothing from this turn.
    pub quiet: bool,
    pub tools: ToolMessage,
    text_buffer: tokio::sync::Mutex<String>,
    reply_to: std::sync::Mutex<Option<MessageId>>,
}

impl TurnUi {
    pub fn new(chat: ChatId, reply_to: Option<MessageId>, quiet: bool) -> Arc<Self> {
        Arc::new(Self {
            chat,
            quiet,
            tools: ToolMessage::new(chat),
            text_buffer: tokio::sync::Mutex::new(String::new()),
            reply_to: std::sync::Mutex::new(reply_to),
        })
    }

    pub async fn push_text(&self, text: &str) {
        let mut buffer = self.text_buffer.lock().await;
        if !buffer.is_empty() {
            buffer.push_str("\n\n");
        }
        buffer.push_str(text);
    }

    pub async fn take_text(&self) -> String {
        std::mem::take(&mut *self.text_buffer.lock().await)
    }

    /// Flush buffered assistant text as one message — called before an
    /// interactive dialog so the user sees context first.
    pub async fn flush_text(&self, api: &dyn ChatApi) {
        if self.quiet {
            return;
        }
        let text = self.take_text().await;
        if text.is_empty() {
            return;
        }
        let msg = OutgoingMessage::markdown(text).reply_to(self.reply_to());
        if let Err(e) = api.send(self.chat, msg).await {
            debug!(error = %e, "text flush failed");
        }
    }

    pub fn reply_to(&self) -> Option<MessageId> {
        *self.reply_to.lock().unwrap()
    }

    /// The reply target advances when the user answers an AskUserQuestion
    /// with a typed message instead of a button.
    pub fn advance_reply_to(&self, id: MessageId) {
        *self.reply_to.lock().unwrap() = Some(id);
    }
}
