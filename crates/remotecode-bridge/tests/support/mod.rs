//! Shared fixtures for orchestrator integration tests: a recording chat
//! transport and shell-script stand-ins for the Agent CLI.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use remotecode_bridge::Bridge;
use remotecode_core::chat::{ChatApi, Keyboard, OutgoingMessage};
use remotecode_core::config::Config;
use remotecode_core::error::Result as CoreResult;
use remotecode_core::types::{ChatId, MessageId};

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub chat: ChatId,
    pub id: MessageId,
    pub text: String,
    pub keyboard: Option<Keyboard>,
}

#[derive(Default)]
pub struct MockChat {
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
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.text.clone())
            .collect()
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

    /// First message carrying an inline keyboard whose payloads start with
    /// `prefix` — i.e. a dialog.
    pub fn dialog_with_prefix(&self, prefix: &str) -> Option<SentMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .find(|m| {
                m.keyboard.as_ref().is_some_and(|k| {
                    k.iter()
                        .flatten()
                        .any(|b| b.data.starts_with(prefix))
                })
            })
            .cloned()
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

/// Replies immediately with one text block.
pub const TEXT_AGENT: &str = r#"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    *control_response*) ;;
    *control_request*) ;;
    *)
      echo '{"type":"system","subtype":"init"}'
      echo '{"type":"assistant","message":{"content":[{"type":"text","text":"All set."}]}}'
      echo '{"type":"result","is_error":false}'
      ;;
  esac
done
"#;

/// Replies after 2 s — long enough to switch sessions mid-stream.
pub const SLOW_AGENT: &str = r#"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    *control_response*) ;;
    *control_request*) ;;
    *)
      echo '{"type":"system","subtype":"init"}'
      sleep 2
      echo '{"type":"assistant","message":{"content":[{"type":"text","text":"slow answer"}]}}'
      echo '{"type":"result","is_error":false}'
      ;;
  esac
done
"#;

/// Numbers its replies via a counter file next to the script, with a 1 s
/// delay so a second prompt lands while the first is streaming.
pub const COUNTER_AGENT: &str = r#"#!/bin/sh
count_file="$(dirname "$0")/count"
while IFS= read -r line; do
  case "$line" in
    *control_response*) ;;
    *control_request*) ;;
    *)
      n=$(cat "$count_file" 2>/dev/null || echo 0)
      n=$((n+1))
      echo "$n" > "$count_file"
      echo '{"type":"system","subtype":"init"}'
      sleep 1
      echo "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"reply $n\"}]}}"
      echo '{"type":"result","is_error":false}'
      ;;
  esac
done
"#;

/// Requests permission for one Bash invocation, then finishes once any
/// control response arrives.
pub const TOOL_AGENT: &str = r#"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    *control_response*)
      echo '{"type":"assistant","message":{"content":[{"type":"text","text":"done"}]}}'
      echo '{"type":"result","is_error":false}'
      ;;
    *control_request*) ;;
    *)
      echo '{"type":"system","subtype":"init"}'
      echo '{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}'
      echo '{"type":"control_request","request_id":"r1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"ls"},"tool_use_id":"t1"}}'
      ;;
  esac
done
"#;

pub struct Fixture {
    pub bridge: Arc<Bridge>,
    pub chat: Arc<MockChat>,
    pub workdir: PathBuf,
    _home: tempfile::TempDir,
    _projects: tempfile::TempDir,
    _workdir: tempfile::TempDir,
    _script: tempfile::TempDir,
}

pub fn fixture(script: &str, yolo: bool) -> Fixture {
    use std::os::unix::fs::PermissionsExt;

    let home = tempfile::TempDir::new().unwrap();
    let projects = tempfile::TempDir::new().unwrap();
    let workdir = tempfile::TempDir::new().unwrap();
    let script_dir = tempfile::TempDir::new().unwrap();

    let bin = script_dir.path().join("fake-agent");
    std::fs::write(&bin, script).unwrap();
    std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

    let config = Config {
        bot_token: "test-token".to_string(),
        allowed_users: vec!["1".to_string()],
        yolo,
        verbose: false,
        auto_sync: false,
        agent_bin: bin.to_string_lossy().into_owned(),
        home: home.path().to_path_buf(),
        projects_root: projects.path().to_path_buf(),
        agent_settings: home.path().join("agent-settings.json"),
    };

    let chat = MockChat::new();
    let bridge = Bridge::new(config, chat.clone(), None);

    Fixture {
        bridge,
        chat,
        workdir: workdir.path().to_path_buf(),
        _home: home,
        _projects: projects,
        _workdir: workdir,
        _script: script_dir,
    }
}

pub async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}
