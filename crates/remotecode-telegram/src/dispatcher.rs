//! Long-polling dispatcher.
//!
//! Converts teloxide updates into transport-neutral [`ChatUpdate`]s and
//! forwards them to the injected [`UpdateSink`]. Allowlist filtering happens
//! here, before anything reaches the bridge.

use std::sync::Arc;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::UpdateKind;
use tracing::{info, warn};

use remotecode_core::chat::ChatUpdate;
use remotecode_core::error::{CoreError, Result};
use remotecode_core::types::{ChatId, MessageId};

use crate::allow;

/// Where converted updates go — the daemon wires this to the bridge.
#[async_trait]
pub trait UpdateSink: Send + Sync + 'static {
    async fn handle(&self, update: ChatUpdate);
}

/// Verify nothing else is long-polling this bot token. Telegram answers a
/// concurrent `getUpdates` with a conflict error; three strikes and the
/// daemon refuses to start.
pub async fn preflight(bot: &Bot) -> Result<()> {
    // Any webhook would also swallow our updates.
    let _ = bot.delete_webhook().await;

    let mut last = None;
    for attempt in 1..=3u32 {
        match bot.get_updates().limit(1).timeout(0).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                let message = e.to_string();
                let conflict = message
                    .to_lowercase()
                    .contains("terminated by other getupdates");
                warn!(attempt, conflict, error = %message, "getUpdates preflight failed");
                last = Some(if conflict {
                    CoreError::TransportConflict
                } else {
                    CoreError::Transport(message)
                });
                tokio::time::sleep(std::time::Duration::from_secs(3)).await;
            }
        }
    }
    Err(last.unwrap_or(CoreError::TransportConflict))
}

pub struct TelegramDispatcher {
    bot: Bot,
    allowed: Arc<Vec<String>>,
}

impl TelegramDispatcher {
    pub fn new(bot: Bot, allowed: Vec<String>) -> Self {
        Self {
            bot,
            allowed: Arc::new(allowed),
        }
    }

    /// Drive the long-polling loop for the lifetime of the process.
    pub async fn run(self, sink: Arc<dyn UpdateSink>) {
        info!("telegram dispatcher: starting long polling");
        let allowed = Arc::clone(&self.allowed);

        let handler = dptree::entry().endpoint(
            move |update: Update, sink: Arc<dyn UpdateSink>, allowed: Arc<Vec<String>>| async move {
                if let Some(converted) = convert(&update, &allowed) {
                    sink.handle(converted).await;
                }
                respond(())
            },
        );

        Dispatcher::builder(self.bot, handler)
            .dependencies(dptree::deps![sink, allowed])
            .default_handler(|_upd| async {})
            .build()
            .dispatch()
            .await;
    }
}

/// Map one Telegram update to a domain update; `None` drops it (bots,
/// non-allowlisted senders, unsupported media).
fn convert(update: &Update, allowed: &[String]) -> Option<ChatUpdate> {
    match &update.kind {
        UpdateKind::Message(msg) => {
            let from = msg.from.as_ref()?;
            if from.is_bot {
                return None;
            }
            if !allow::is_allowed(
                allowed,
                from.username.as_deref().unwrap_or(""),
                &from.id.0.to_string(),
            ) {
                return None;
            }
            let chat = ChatId(msg.chat.id.0);
            let message_id = MessageId(msg.id.0);

            if let Some(voice) = msg.voice() {
                return Some(ChatUpdate::Voice {
                    chat,
                    message_id,
                    file_id: voice.file.id.clone(),
                });
            }
            if let Some(photos) = msg.photo() {
                // Largest rendition last.
                let best = photos.last()?;
                return Some(ChatUpdate::Photo {
                    chat,
                    message_id,
                    file_id: best.file.id.clone(),
                    caption: msg.caption().unwrap_or("").to_string(),
                });
            }
            let text = msg.text()?.trim();
            if text.is_empty() {
                return None;
            }
            Some(ChatUpdate::Text {
                chat,
                message_id,
                text: text.to_string(),
            })
        }
        UpdateKind::CallbackQuery(query) => {
            if !allow::is_allowed(
                allowed,
                query.from.username.as_deref().unwrap_or(""),
                &query.from.id.0.to_string(),
            ) {
                return None;
            }
            let message = query.message.as_ref()?;
            Some(ChatUpdate::Callback {
                chat: ChatId(message.chat().id.0),
                message_id: MessageId(message.id().0),
                callback_id: query.id.clone(),
                data: query.data.clone()?,
            })
        }
        _ => None,
    }
}
