//! In-crate test doubles.

use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use remotecode_core::chat::{ChatApi, Keyboard, OutgoingMessage};
use remotecode_core::config::Config;
use remotecode_core::error::Result as CoreResult;
use remotecode_core::types::{ChatId, MessageId};

use crate::state::Bridge;

#[derive(Debug, Clone)]
pub(crate) struct SentMessage {
    pub chat: ChatId,
    pub id: MessageId,
    pub text: String,
    pub keyboard: Option<Keyboard>,
}

/// Records every transport call instead of talking to Telegram.
#[derive(Default)]
pub(crate) struct MockChat {
    next_id: AtomicI32,
    pub sent: Mutex<Vec<SentMessage>>,
    pub edits: Mutex<Vec<(MessageId, String)>>,
    pub deleted: Mutex<Vec<MessageId>>,
}

impl MockChat {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|m| m.text.clone()).collect()
    }

    pub fn any_sent(&self, needle: &str) -> bool {
        self.texts().iter().any(|t| t.contains(needle))
    }

    pub fn any_edit(&self, needle: &str) -> bool {
        self.edits
            .lock()
            .unwrap()
            .iter()
            .any(|(_, t)| t.contains(needle))
    }
}

#[async_trait]
impl ChatApi for MockChat {
    async fn send(&self, chat: ChatId, msg: OutgoingMessage) -> CoreResult<MessageId> {
        let id = MessageId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.sent.lock().unwrap().push(SentMessage {
            chat,
            id,
            text: msg.text,
            keyboard: msg.keyboard,
        });
        Ok(id)
    }

    async fn edit(&self, _chat: ChatId, id: MessageId, msg: OutgoingMessage) -> CoreResult<()> {
        self.edits.lock().unwrap().push((id, msg.text));
        Ok(())
    }

    async fn delete(&self, _chat: ChatId, id: MessageId) -> CoreResult<()> {
        self.deleted.lock().unwrap().push(id);
        Ok(())
    }

    async fn answer_callback(&self, _callback_id: &str, _text: Option<&str>) -> CoreResult<()> {
        Ok(())
    }

    async fn typing(&self, _chat: ChatId) -> CoreResult<()> {
        Ok(())
    }

    async fn set_commands(&self, _commands: &[(String, String)]) -> CoreResult<()> {
        Ok(())
    }

    async fn download_file(&self, _file_id: &str, dest: &Path) -> CoreResult<()> {
        std::fs::write(dest, b"")?;
        Ok(())
    }
}

pub(crate) fn test_config(home: &Path, projects_root: &Path) -> Config {
    Config {
        bot_token: "test-token".to_string(),
        allowed_users: vec!["1".to_string()],
        yolo: false,
        verbose: false,
        auto_sync: false,
        agent_bin: "false".to_string(),
        home: home.to_path_buf(),
        projects_root: projects_root.to_path_buf(),
        agent_settings: home.join("agent-settings.json"),
    }
}

pub(crate) fn test_bridge(home: &Path, projects_root: &Path) -> (Arc<Bridge>, Arc<MockChat>) {
    let chat = MockChat::new();
    let bridge = Bridge::new(test_config(home, projects_root), chat.clone(), None);
    (bridge, chat)
}
