//! Global scanner — surfaces pending permissions in non-selected sessions.
//!
//! Every 10 s it walks session files modified within the last 5 minutes
//! (skipping the active session, sessions with a live orchestrator turn, and
//! anything written in the last 30 s — racing a fresh write would misread a
//! half-recorded exchange), scans each tail for pending tool_uses, and posts
//! one takeover notification per session. Ticks also re-check standing
//! notifications: resolved pending sets get a "✓ Resolved" edit, sessions
//! that aged out get their notification deleted.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use remotecode_core::chat::{Button, OutgoingMessage};
use remotecode_core::types::{ChatId, MessageId, SessionId};
use remotecode_store::tail;

use crate::render::{clip, pending_descriptor};
use crate::state::Bridge;

const SCAN_INTERVAL: Duration = Duration::from_secs(10);
/// Only files touched this recently are scanned at all.
const RECENT_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Files younger than this are left alone — the writer may still be mid-turn.
const QUIET_AGE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Notice {
    pub chat: ChatId,
    /// `None` after dismissal deleted the message.
    pub message_id: Option<MessageId>,
    pub text: String,
    pub dismissed: bool,
    pub continued: bool,
}

#[derive(Default)]
pub struct ScannerShared {
    notified: DashMap<SessionId, Notice>,
}

impl ScannerShared {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dismiss: suppress re-posting until the pending set naturally resolves.
    /// Returns the message to delete, if still visible.
    pub fn dismiss(&self, session: &SessionId) -> Option<(ChatId, MessageId)> {
        let mut entry = self.notified.get_mut(session)?;
        entry.dismissed = true;
        let chat = entry.chat;
        entry.message_id.take().map(|id| (chat, id))
    }

    /// Takeover clicked: keep the entry (no re-post) and return the message
    /// so the caller can rewrite it to "Continuing in Telegram".
    pub fn mark_continued(&self, session: &SessionId) -> Option<(ChatId, MessageId, String)> {
        let mut entry = self.notified.get_mut(session)?;
        entry.continued = true;
        let chat = entry.chat;
        let text = entry.text.clone();
        entry.message_id.map(|id| (chat, id, text))
    }

    pub fn is_notified(&self, session: &SessionId) -> bool {
        self.notified.contains_key(session)
    }
}

/// Drive the scanner until shutdown.
pub async fn run(bridge: Arc<Bridge>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(SCAN_INTERVAL);
    info!("scanner started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => tick(&bridge).await,
        }
    }
    info!("scanner stopped");
}

async fn tick(bridge: &Arc<Bridge>) {
    let Some(chat) = bridge.notify_chat() else {
        return;
    };
    let active = bridge.active_session();
    let recent = bridge.store.sessions_modified_within(RECENT_WINDOW);
    let recent_ids: HashSet<SessionId> = recent.iter().map(|s| s.id.clone()).collect();

    for info in &recent {
        if active.as_ref() == Some(&info.id) {
            continue;
        }
        if bridge.is_processing(&info.id) {
            continue;
        }
        let age = SystemTime::now()
            .duration_since(info.modified)
            .unwrap_or_default();
        if age < QUIET_AGE {
            continue;
        }

        let pending = tail::pending_tool_uses(&info.path);
        if pending.is_empty() {
            resolve_notice(bridge, &info.id).await;
            continue;
        }
        if bridge.scanner.is_notified(&info.id) {
            continue;
        }

        let snippet = tail::last_user_text(&info.path)
            .map(|t| clip(&t, 80))
            .unwrap_or_else(|| "(no input)".to_string());
        let text = format!(
            "🔔 Permission pending in another session\n📁 {}\n💬 {}\n{}",
            info.workdir.display(),
            snippet,
            pending_descriptor(&pending[0]),
        );
        let keyboard = vec![vec![
            Button::new(
                "▶️ Continue in Telegram",
                format!("takeover:{}", info.id.as_str()),
            ),
            Button::new(
                "✖️ Dismiss",
                format!("takeover:dismiss:{}", info.id.as_str()),
            ),
        ]];
        match bridge
            .chat
            .send(
                chat,
                OutgoingMessage::text(text.clone()).with_keyboard(keyboard),
            )
            .await
        {
            Ok(message_id) => {
                info!(session = %info.id.short(), "posted pending-permission notification");
                bridge.scanner.notified.insert(
                    info.id.clone(),
                    Notice {
                        chat,
                        message_id: Some(message_id),
                        text,
                        dismissed: false,
                        continued: false,
                    },
                );
            }
            Err(e) => debug!(error = %e, "scanner notification send failed"),
        }
    }

    // Notifications whose session aged out of the recent window disappear.
    let stale: Vec<SessionId> = bridge
        .scanner
        .notified
        .iter()
        .filter(|e| !recent_ids.contains(e.key()))
        .map(|e| e.key().clone())
        .collect();
    for session in stale {
        if let Some((_, notice)) = bridge.scanner.notified.remove(&session) {
            if let Some(message_id) = notice.message_id {
                let _ = bridge.chat.delete(notice.chat, message_id).await;
            }
        }
    }
}

/// The pending set emptied on its own: append "✓ Resolved" and forget the
/// session (a dismissed one becomes postable again when new tool_uses pend).
async fn resolve_notice(bridge: &Arc<Bridge>, session: &SessionId) {
    let Some((_, notice)) = bridge.scanner.notified.remove(session) else {
        return;
    };
    if notice.continued {
        return;
    }
    if let Some(message_id) = notice.message_id {
        let _ = bridge
            .chat
            .edit(
                notice.chat,
                message_id,
                OutgoingMessage::text(format!(
                    "{}\n✅ Resolved at {}",
                    notice.text,
                    chrono::Local::now().format("%H:%M")
                )),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_bridge, MockChat};
    use remotecode_core::types::SessionId;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn tool_use_line(id: &str) -> String {
        format!(
            "{{\"type\":\"assistant\",\"message\":{{\"role\":\"assistant\",\"content\":[{{\"type\":\"tool_use\",\"id\":\"{id}\",\"name\":\"Bash\",\"input\":{{\"command\":\"make deploy\"}}}}]}}}}\n"
        )
    }

    fn tool_result_line(id: &str) -> String {
        format!(
            "{{\"type\":\"user\",\"message\":{{\"role\":\"user\",\"content\":[{{\"type\":\"tool_result\",\"tool_use_id\":\"{id}\"}}]}}}}\n"
        )
    }

    fn user_line(text: &str) -> String {
        format!(
            "{{\"type\":\"user\",\"message\":{{\"role\":\"user\",\"content\":\"{text}\"}}}}\n"
        )
    }

    fn age_file(path: &PathBuf, secs_ago: u64) {
        let past = SystemTime::now() - Duration::from_secs(secs_ago);
        let file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.set_times(std::fs::FileTimes::new().set_modified(past))
            .unwrap();
    }

    struct Fixture {
        _home: TempDir,
        _projects: TempDir,
        bridge: Arc<crate::state::Bridge>,
        chat: Arc<MockChat>,
        session: SessionId,
        path: PathBuf,
    }

    /// A host-driven session with one pending tool_use, aged past the quiet
    /// window, while a different session is active in the registry.
    fn fixture() -> Fixture {
        let home = TempDir::new().unwrap();
        let projects = TempDir::new().unwrap();
        let (bridge, chat) = test_bridge(home.path(), projects.path());

        let active = SessionId::generate();
        bridge
            .registry
            .set_active(&active, home.path())
            .unwrap();
        bridge.registry.set_chat_id(5).unwrap();

        let session = SessionId::generate();
        let project = projects.path().join("-work-proj");
        std::fs::create_dir_all(&project).unwrap();
        let path = project.join(format!("{session}.jsonl"));
        std::fs::write(&path, user_line("deploy it") + &tool_use_line("t1")).unwrap();
        age_file(&path, 60);

        Fixture {
            _home: home,
            _projects: projects,
            bridge,
            chat,
            session,
            path,
        }
    }

    #[tokio::test]
    async fn pending_session_gets_one_notification() {
        let fx = fixture();
        tick(&fx.bridge).await;

        assert!(fx.chat.any_sent("Permission pending in another session"));
        assert!(fx.chat.any_sent("make deploy"));
        assert!(fx.chat.any_sent("deploy it"));
        assert!(fx.bridge.scanner.is_notified(&fx.session));

        // Second tick: no duplicate.
        let before = fx.chat.sent.lock().unwrap().len();
        tick(&fx.bridge).await;
        assert_eq!(fx.chat.sent.lock().unwrap().len(), before);
    }

    #[tokio::test]
    async fn fresh_writes_are_left_alone() {
        let fx = fixture();
        age_file(&fx.path, 5);
        tick(&fx.bridge).await;
        assert!(fx.chat.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn active_session_is_never_scanned() {
        let fx = fixture();
        // Make the pending session the active one.
        fx.bridge
            .registry
            .set_active(&fx.session, fx.path.parent().unwrap())
            .unwrap();
        tick(&fx.bridge).await;
        assert!(fx.chat.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolution_edits_the_notification() {
        let fx = fixture();
        tick(&fx.bridge).await;
        assert!(fx.bridge.scanner.is_notified(&fx.session));

        std::fs::OpenOptions::new()
            .append(true)
            .open(&fx.path)
            .map(|mut f| {
                use std::io::Write;
                f.write_all(tool_result_line("t1").as_bytes()).unwrap();
            })
            .unwrap();
        age_file(&fx.path, 60);

        tick(&fx.bridge).await;
        assert!(fx.chat.any_edit("✅ Resolved"));
        assert!(!fx.bridge.scanner.is_notified(&fx.session));
    }

    #[tokio::test]
    async fn dismiss_suppresses_reposting() {
        let fx = fixture();
        tick(&fx.bridge).await;

        let (chat, message_id) = fx.bridge.scanner.dismiss(&fx.session).unwrap();
        let _ = fx.bridge.chat.delete(chat, message_id).await;

        let before = fx.chat.sent.lock().unwrap().len();
        tick(&fx.bridge).await;
        assert_eq!(
            fx.chat.sent.lock().unwrap().len(),
            before,
            "dismissed session was re-posted"
        );
    }

    #[tokio::test]
    async fn aged_out_notification_is_deleted() {
        let fx = fixture();
        tick(&fx.bridge).await;
        assert!(fx.bridge.scanner.is_notified(&fx.session));

        // Fall out of the 5-minute window.
        age_file(&fx.path, 600);
        tick(&fx.bridge).await;

        assert!(!fx.bridge.scanner.is_notified(&fx.session));
        assert!(!fx.chat.deleted.lock().unwrap().is_empty());
    }
}
