//! teloxide-backed implementation of the core `ChatApi`.

use std::path::Path;

use async_trait::async_trait;
use teloxide::net::Download;
use teloxide::payloads::{EditMessageTextSetters, SendMessageSetters};
use teloxide::prelude::*;
use teloxide::types::{
    BotCommand, ChatAction, InlineKeyboardButton, InlineKeyboardMarkup, ParseMode,
    ReplyParameters,
};
use tracing::{debug, warn};

use remotecode_core::chat::{ChatApi, Keyboard, OutgoingMessage};
use remotecode_core::error::{CoreError, Result};
use remotecode_core::types::{ChatId, MessageId};

use crate::markdown::escape_markdown_v2;

pub struct TelegramApi {
    bot: Bot,
}

impl TelegramApi {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn transport(e: teloxide::RequestError) -> CoreError {
    CoreError::Transport(e.to_string())
}

fn markup(keyboard: &Keyboard) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(keyboard.iter().map(|row| {
        row.iter()
            .map(|b| InlineKeyboardButton::callback(b.label.clone(), b.data.clone()))
    }))
}

#[async_trait]
impl ChatApi for TelegramApi {
    async fn send(&self, chat: ChatId, msg: OutgoingMessage) -> Result<MessageId> {
        let chat_id = teloxide::types::ChatId(chat.0);

        if msg.markdown {
            // MarkdownV2 first; Telegram rejects bad markup with a 400, in
            // which case the same body goes out once more as plain text.
            let mut request = self
                .bot
                .send_message(chat_id, escape_markdown_v2(&msg.text))
                .parse_mode(ParseMode::MarkdownV2);
            if let Some(reply) = msg.reply_to {
                request = request
                    .reply_parameters(ReplyParameters::new(teloxide::types::MessageId(reply.0)));
            }
            if let Some(keyboard) = &msg.keyboard {
                request = request.reply_markup(markup(keyboard));
            }
            match request.await {
                Ok(sent) => return Ok(MessageId(sent.id.0)),
                Err(e) => debug!(error = %e, "MarkdownV2 rejected, retrying plain"),
            }
        }

        let mut request = self.bot.send_message(chat_id, &msg.text);
        if let Some(reply) = msg.reply_to {
            request = request
                .reply_parameters(ReplyParameters::new(teloxide::types::MessageId(reply.0)));
        }
        if let Some(keyboard) = &msg.keyboard {
            request = request.reply_markup(markup(keyboard));
        }
        let sent = request.await.map_err(transport)?;
        Ok(MessageId(sent.id.0))
    }

    async fn edit(&self, chat: ChatId, id: MessageId, msg: OutgoingMessage) -> Result<()> {
        let chat_id = teloxide::types::ChatId(chat.0);
        let message_id = teloxide::types::MessageId(id.0);

        let mut request = self.bot.edit_message_text(chat_id, message_id, &msg.text);
        if let Some(keyboard) = &msg.keyboard {
            request = request.reply_markup(markup(keyboard));
        }
        match request.await {
            Ok(_) => Ok(()),
            // Editing to identical content is a Telegram 400; harmless.
            Err(e) => {
                debug!(error = %e, "message edit rejected");
                Ok(())
            }
        }
    }

    async fn delete(&self, chat: ChatId, id: MessageId) -> Result<()> {
        self.bot
            .delete_message(
                teloxide::types::ChatId(chat.0),
                teloxide::types::MessageId(id.0),
            )
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        let mut request = self.bot.answer_callback_query(callback_id.to_string());
        if let Some(text) = text {
            request = teloxide::payloads::AnswerCallbackQuerySetters::text(request, text);
        }
        request.await.map_err(transport)?;
        Ok(())
    }

    async fn typing(&self, chat: ChatId) -> Result<()> {
        self.bot
            .send_chat_action(teloxide::types::ChatId(chat.0), ChatAction::Typing)
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn set_commands(&self, commands: &[(String, String)]) -> Result<()> {
        let commands: Vec<BotCommand> = commands
            .iter()
            .map(|(c, d)| BotCommand::new(c.clone(), d.clone()))
            .collect();
        self.bot.set_my_commands(commands).await.map_err(transport)?;
        Ok(())
    }

    async fn download_file(&self, file_id: &str, dest: &Path) -> Result<()> {
        let file = self
            .bot
            .get_file(file_id.to_string())
            .await
            .map_err(transport)?;
        let mut out = tokio::fs::File::create(dest).await?;
        if let Err(e) = self.bot.download_file(&file.path, &mut out).await {
            warn!(error = %e, "file download failed");
            return Err(CoreError::Transport(e.to_string()));
        }
        Ok(())
    }
}
