//! Watcher — tails the active session's record file.
//!
//! Rebinds when the registry's active session changes (3 s poll). Filesystem
//! notifications are debounced 500 ms, then the new tail is read by byte
//! offset. Two passes per tail: the permission pass maintains the pending
//! tool_use map and raises the host-side notification; the display pass
//! (auto-sync only) mirrors text turns into chat. Everything is skipped when
//! the orchestrator is mid-turn on the same session — the offset still
//! advances so nothing replays later.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use remotecode_core::chat::{Button, OutgoingMessage};
use remotecode_core::types::{ChatId, MessageId, SessionId};
use remotecode_store::tail::TailReader;
use remotecode_store::{PendingToolUse, SessionRecord};

use crate::render::{clip, pending_descriptor};
use crate::state::Bridge;

const REBIND_POLL: Duration = Duration::from_secs(3);
const FS_DEBOUNCE: Duration = Duration::from_millis(500);
/// The host-side pending notification waits this long — quick local answers
/// never reach chat.
const NOTIFY_DEBOUNCE: Duration = Duration::from_secs(8);

struct WatcherState {
    session: Option<SessionId>,
    path: Option<PathBuf>,
    reader: TailReader,
    pending: HashMap<String, PendingToolUse>,
    notice: Option<(ChatId, MessageId)>,
    notify_gen: u64,
}

pub struct WatcherShared {
    state: tokio::sync::Mutex<WatcherState>,
}

impl WatcherShared {
    pub fn new() -> Self {
        Self {
            state: tokio::sync::Mutex::new(WatcherState {
                session: None,
                path: None,
                reader: TailReader::new(0),
                pending: HashMap::new(),
                notice: None,
                notify_gen: 0,
            }),
        }
    }

    /// Orchestrator-callable: jump the tail offset to end-of-file so the
    /// watcher never re-emits a turn that was streamed live.
    pub async fn skip_to_end(&self, session: &SessionId) {
        let mut state = self.state.lock().await;
        if state.session.as_ref() != Some(session) {
            return;
        }
        state.notify_gen += 1;
        if let Some(path) = state.path.clone() {
            state.reader.skip_to_end(&path);
        }
    }

    /// Clear the host-side pending notice (takeover/dismiss handling).
    pub async fn take_notice(&self, session: &SessionId) -> Option<(ChatId, MessageId)> {
        let mut state = self.state.lock().await;
        if state.session.as_ref() == Some(session) {
            state.notice.take()
        } else {
            None
        }
    }
}

impl Default for WatcherShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive the watcher until shutdown.
pub async fn run(bridge: Arc<Bridge>, shutdown: CancellationToken) {
    let (fs_tx, mut fs_rx) = mpsc::channel::<()>(32);
    let mut fs_watcher: Option<RecommendedWatcher> = None;
    let mut poll = tokio::time::interval(REBIND_POLL);
    info!("watcher started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = poll.tick() => {
                rebind_if_changed(&bridge, &mut fs_watcher, &fs_tx).await;
            }
            Some(_) = fs_rx.recv() => {
                // Debounce: let the write burst settle, swallow the backlog.
                tokio::time::sleep(FS_DEBOUNCE).await;
                while fs_rx.try_recv().is_ok() {}
                process_tail(&bridge).await;
            }
        }
    }
    info!("watcher stopped");
}

async fn rebind_if_changed(
    bridge: &Arc<Bridge>,
    fs_watcher: &mut Option<RecommendedWatcher>,
    fs_tx: &mpsc::Sender<()>,
) {
    let active = bridge.active_session();
    let mut state = bridge.watcher.state.lock().await;

    if state.session == active {
        // Same binding; retry the fs watch if it never attached (the project
        // directory may only appear after the Agent's first write).
        if fs_watcher.is_none() {
            if let Some(path) = state.path.clone() {
                *fs_watcher = attach_watch(&path, fs_tx.clone());
            }
        }
        return;
    }

    info!(
        old = %state.session.as_ref().map(|s| s.short().to_string()).unwrap_or_default(),
        new = %active.as_ref().map(|s| s.short().to_string()).unwrap_or_default(),
        "watcher rebinding"
    );
    state.session = active.clone();
    state.pending.clear();
    state.notice = None;
    state.notify_gen += 1;
    *fs_watcher = None;

    match active {
        Some(session) => {
            let Some(workdir) = bridge.registry.active_workdir() else {
                state.path = None;
                return;
            };
            let path = bridge.store.session_file(&workdir, &session);
            state.reader = TailReader::new(0);
            // Never replay history on bind — only new growth matters.
            state.reader.skip_to_end(&path);
            *fs_watcher = attach_watch(&path, fs_tx.clone());
            state.path = Some(path);
        }
        None => state.path = None,
    }
}

/// Watch the record file's project directory (non-recursive) so creation of
/// a not-yet-existing file is caught too.
fn attach_watch(path: &std::path::Path, fs_tx: mpsc::Sender<()>) -> Option<RecommendedWatcher> {
    let dir = path.parent()?;
    if !dir.exists() {
        return None;
    }
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if res.is_ok() {
            let _ = fs_tx.try_send(());
        }
    })
    .map_err(|e| {
        warn!(error = %e, "fs watcher creation failed");
        e
    })
    .ok()?;
    watcher.watch(dir, RecursiveMode::NonRecursive).ok()?;
    Some(watcher)
}

async fn process_tail(bridge: &Arc<Bridge>) {
    // Phase 1 under the state lock: read and classify.
    let (session, records, pending_now, resolved_notice) = {
        let mut state = bridge.watcher.state.lock().await;
        let (Some(session), Some(path)) = (state.session.clone(), state.path.clone()) else {
            return;
        };
        if !path.exists() {
            return;
        }

        // Re-entrancy guard: our own turn is writing this file right now.
        // Advance the offset so the self-write never replays.
        if bridge.is_processing(&session) {
            state.reader.skip_to_end(&path);
            return;
        }

        let records = match state.reader.read_new(&path) {
            Ok(records) => records,
            Err(e) => {
                debug!(error = %e, "tail read failed");
                return;
            }
        };
        if records.is_empty() {
            return;
        }

        // Permission pass bookkeeping.
        for record in &records {
            for (id, name, input) in record.tool_uses() {
                state.pending.insert(
                    id.to_string(),
                    PendingToolUse {
                        id: id.to_string(),
                        name: name.to_string(),
                        input: input.clone(),
                    },
                );
            }
            for cleared in record.tool_result_ids() {
                state.pending.remove(cleared);
            }
        }

        let pending_now = !state.pending.is_empty();
        let resolved_notice = if pending_now {
            None
        } else {
            state.notice.take()
        };
        if pending_now {
            state.notify_gen += 1;
        }
        (session, records, pending_now, resolved_notice)
    };

    // Third-party growth invalidates the in-memory channel.
    if let Some(channel) = bridge.channel(&session) {
        channel.mark_stale();
    }

    if pending_now {
        schedule_pending_notice(bridge, &session).await;
    } else if let Some((chat, message_id)) = resolved_notice {
        let _ = bridge
            .chat
            .edit(
                chat,
                message_id,
                OutgoingMessage::text("✅ Resolved on host"),
            )
            .await;
    }

    display_pass(bridge, &records).await;
}

/// 8-second debounced "pending on host" notification.
async fn schedule_pending_notice(bridge: &Arc<Bridge>, session: &SessionId) {
    let generation = {
        let state = bridge.watcher.state.lock().await;
        state.notify_gen
    };
    let bridge = Arc::clone(bridge);
    let session = session.clone();
    tokio::spawn(async move {
        tokio::time::sleep(NOTIFY_DEBOUNCE).await;

        let Some(chat) = bridge.notify_chat() else {
            return;
        };
        let descriptor = {
            let state = bridge.watcher.state.lock().await;
            if state.notify_gen != generation
                || state.session.as_ref() != Some(&session)
                || state.pending.is_empty()
                || state.notice.is_some()
            {
                return;
            }
            state.pending.values().next().map(pending_descriptor)
        };
        if bridge.is_processing(&session) {
            return;
        }
        let Some(descriptor) = descriptor else { return };

        let keyboard = vec![vec![
            Button::new(
                "▶️ Continue in Telegram",
                format!("takeover:{}", session.as_str()),
            ),
            Button::new("✖️ Dismiss", format!("takeover:dismiss:{}", session.as_str())),
        ]];
        let text = format!(
            "⏳ Permission pending on this host (since {})\n{descriptor}",
            chrono::Local::now().format("%H:%M")
        );
        match bridge
            .chat
            .send(chat, OutgoingMessage::text(text).with_keyboard(keyboard))
            .await
        {
            Ok(message_id) => {
                let mut state = bridge.watcher.state.lock().await;
                if state.session.as_ref() == Some(&session) {
                    state.notice = Some((chat, message_id));
                }
            }
            Err(e) => debug!(error = %e, "pending notice send failed"),
        }
    });
}

/// Mirror host-side text turns into chat when auto-sync is on.
async fn display_pass(bridge: &Arc<Bridge>, records: &[SessionRecord]) {
    let auto_sync = bridge
        .registry
        .auto_sync()
        .unwrap_or(bridge.config.auto_sync);
    if !auto_sync {
        return;
    }
    let Some(chat) = bridge.notify_chat() else {
        return;
    };
    for record in records {
        let line = if record.is_real_user_text() {
            Some(format!("[sync] You: {}", clip(&record.text(), 1000)))
        } else if record.is_assistant_text() {
            Some(format!("[sync] Bot: {}", clip(&record.text(), 1000)))
        } else {
            None
        };
        if let Some(line) = line {
            let _ = bridge.chat.send(chat, OutgoingMessage::text(line)).await;
        }
    }
}
