//! Incoming-update classification and routing.
//!
//! Every update lands in [`handle_update`], which catches and reports errors
//! so one bad message never kills the dispatcher. Texts become prompts,
//! `/commands` dispatch here, inline-keyboard callbacks dispatch by payload
//! prefix.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use remotecode_core::chat::{Button, ChatUpdate, Keyboard, OutgoingMessage};
use remotecode_core::types::{ChatId, MessageId, SessionId};
use remotecode_store::encode::decode_project_dir;

use crate::error::{BridgeError, Result};
use crate::orchestrator::{cancel_active, resolve_session, submit_prompt, switch_session, takeover};
use crate::pending::Reply;
use crate::render::{command_safe, session_line, HELP_TEXT};
use crate::state::Bridge;

const SESSION_LIST_LIMIT: usize = 10;
const HISTORY_TURNS: usize = 20;

/// Models offered by `/model`. The Agent CLI resolves the aliases.
const MODELS: &[&str] = &["sonnet", "opus", "haiku"];

/// The bot command menu registered at startup.
pub fn command_menu() -> Vec<(String, String)> {
    [
        ("start", "Show help"),
        ("help", "Show help"),
        ("sessions", "Recent sessions"),
        ("projects", "Projects overview"),
        ("new", "Start a fresh session"),
        ("history", "Recent turns of the active session"),
        ("model", "Pick the model"),
        ("resume", "Switch to a session by id prefix"),
        ("cancel", "Stop the current turn"),
        ("sync", "Toggle host-activity mirroring"),
    ]
    .iter()
    .map(|(c, d)| (c.to_string(), d.to_string()))
    .collect()
}

/// Top-level update handler: classify, route, report errors to the chat.
pub async fn handle_update(bridge: Arc<Bridge>, update: ChatUpdate) {
    let chat = update.chat();
    let _ = bridge.registry.set_chat_id(chat.0);

    if let Err(e) = route(&bridge, update).await {
        warn!(error = %e, "update handling failed");
        let _ = bridge
            .chat
            .send(chat, OutgoingMessage::text(format!("⚠️ {e}")))
            .await;
    }
}

async fn route(bridge: &Arc<Bridge>, update: ChatUpdate) -> Result<()> {
    match update {
        ChatUpdate::Text {
            chat,
            message_id,
            text,
        } => {
            if text.starts_with('/') {
                handle_command(bridge, chat, &text).await
            } else {
                submit_prompt(bridge, chat, Some(message_id), text, false, Vec::new()).await
            }
        }
        ChatUpdate::Photo {
            chat,
            message_id,
            file_id,
            caption,
        } => handle_photo(bridge, chat, message_id, &file_id, caption).await,
        ChatUpdate::Voice {
            chat,
            message_id,
            file_id,
        } => handle_voice(bridge, chat, message_id, &file_id).await,
        ChatUpdate::Callback {
            chat,
            message_id,
            callback_id,
            data,
        } => {
            let _ = bridge.chat.answer_callback(&callback_id, None).await;
            handle_callback(bridge, chat, message_id, &data).await
        }
    }
}

async fn handle_photo(
    bridge: &Arc<Bridge>,
    chat: ChatId,
    message_id: MessageId,
    file_id: &str,
    caption: String,
) -> Result<()> {
    let tmp = temp_path(bridge, "jpg");
    bridge.chat.download_file(file_id, &tmp).await?;
    let mut prompt = caption.trim().to_string();
    if prompt.is_empty() {
        prompt = "Look at the attached image.".to_string();
    }
    prompt.push_str(&format!("\n[Attached image: {}]", tmp.display()));
    submit_prompt(bridge, chat, Some(message_id), prompt, false, vec![tmp]).await
}

async fn handle_voice(
    bridge: &Arc<Bridge>,
    chat: ChatId,
    message_id: MessageId,
    file_id: &str,
) -> Result<()> {
    let Some(transcriber) = bridge.transcriber.clone() else {
        return Err(BridgeError::VoiceUnavailable(
            "transcription is not configured".to_string(),
        ));
    };
    let tmp = temp_path(bridge, "ogg");
    bridge.chat.download_file(file_id, &tmp).await?;
    let transcribed = transcriber.transcribe(&tmp).await;
    let _ = std::fs::remove_file(&tmp);
    let text = transcribed?;

    let _ = bridge
        .chat
        .send(chat, OutgoingMessage::text(format!("🎤 {text}")))
        .await;
    submit_prompt(bridge, chat, Some(message_id), text, true, Vec::new()).await
}

fn temp_path(bridge: &Arc<Bridge>, ext: &str) -> PathBuf {
    let dir = bridge.config.home.join("tmp");
    let _ = std::fs::create_dir_all(&dir);
    dir.join(format!("{}.{ext}", uuid::Uuid::new_v4().simple()))
}

// ---------------------------------------------------------------------------
// Slash commands
// ---------------------------------------------------------------------------

async fn handle_command(bridge: &Arc<Bridge>, chat: ChatId, text: &str) -> Result<()> {
    let command = text.split_whitespace().next().unwrap_or(text);
    let argument = text[command.len()..].trim().to_string();
    // Strip the bot-mention suffix Telegram appends in groups.
    let command = command.split('@').next().unwrap_or(command);

    match command {
        "/start" | "/help" => {
            send(bridge, chat, HELP_TEXT.to_string()).await;
        }
        "/sessions" => list_sessions(bridge, chat, None).await,
        "/projects" => list_projects(bridge, chat).await,
        "/new" => new_session(bridge, chat, None).await?,
        "/history" => show_history(bridge, chat).await?,
        "/model" => show_model_picker(bridge, chat).await,
        "/resume" => resume_command(bridge, chat, &argument).await?,
        "/cancel" => cancel_active(bridge, chat).await,
        "/sync" => toggle_sync(bridge, chat).await?,
        other => {
            if let Some(name) = other.strip_prefix("/show_sessions_") {
                show_project_sessions(bridge, chat, name).await;
            } else if let Some(prefix) = other.strip_prefix("/switch_to_") {
                switch_by_prefix(bridge, chat, prefix).await?;
            } else {
                send(bridge, chat, "Unknown command — see /help".to_string()).await;
            }
        }
    }
    Ok(())
}

async fn list_sessions(bridge: &Arc<Bridge>, chat: ChatId, project: Option<&str>) {
    let sessions = match project {
        Some(encoded) => bridge.store.sessions_in_project(encoded, SESSION_LIST_LIMIT),
        None => bridge.store.recent_sessions(SESSION_LIST_LIMIT),
    };
    if sessions.is_empty() {
        send(bridge, chat, "No sessions yet — just send a message".to_string()).await;
        return;
    }

    let active = bridge.active_session();
    let mut lines = vec!["Recent sessions:".to_string()];
    let mut keyboard: Keyboard = Vec::new();
    for info in &sessions {
        let preview = bridge.store.preview(&info.path);
        let marker = if active.as_ref() == Some(&info.id) { "▶ " } else { "" };
        lines.push(format!("{marker}{}", session_line(info, preview.as_deref())));
        keyboard.push(vec![
            Button::new(
                format!("{}{}", marker, info.id.short()),
                format!("sess:{}", info.id.as_str()),
            ),
            Button::new("🗑", format!("sessdel:{}", info.id.as_str())),
        ]);
    }
    let msg = OutgoingMessage::text(lines.join("\n")).with_keyboard(keyboard);
    let _ = bridge.chat.send(chat, msg).await;
}

async fn list_projects(bridge: &Arc<Bridge>, chat: ChatId) {
    let projects = bridge.store.list_projects();
    if projects.is_empty() {
        send(bridge, chat, "No projects found".to_string()).await;
        return;
    }
    let mut lines = vec!["Projects:".to_string()];
    let mut keyboard: Keyboard = Vec::new();
    for project in projects.iter().take(15) {
        lines.push(format!(
            "📁 {} — {} session(s)\n  /show_sessions_{}",
            project.workdir.display(),
            project.session_count,
            command_safe(&project.encoded),
        ));
        keyboard.push(vec![Button::new(
            project.workdir.display().to_string(),
            format!("proj:{}", project.encoded),
        )]);
    }
    let msg = OutgoingMessage::text(lines.join("\n")).with_keyboard(keyboard);
    let _ = bridge.chat.send(chat, msg).await;
}

async fn new_session(bridge: &Arc<Bridge>, chat: ChatId, workdir: Option<PathBuf>) -> Result<()> {
    let workdir = workdir
        .or_else(|| bridge.registry.active_workdir())
        .or_else(|| std::env::current_dir().ok())
        .ok_or(BridgeError::MissingWorkdir)?;
    if !workdir.exists() {
        return Err(BridgeError::WorkdirGone(
            workdir.to_string_lossy().into_owned(),
        ));
    }
    let session = SessionId::generate();
    bridge.registry.set_active(&session, &workdir)?;
    bridge.flags(&session).clear();
    info!(session = %session, workdir = %workdir.display(), "new session");
    send(
        bridge,
        chat,
        format!("🆕 New session {} in {}", session.short(), workdir.display()),
    )
    .await;
    Ok(())
}

async fn show_history(bridge: &Arc<Bridge>, chat: ChatId) -> Result<()> {
    let (session, workdir) = resolve_session(bridge)?;
    let path = bridge.store.session_file(&workdir, &session);
    let records = bridge.store.read_records(&path);
    let mut lines: Vec<String> = records
        .iter()
        .filter_map(|r| {
            if r.is_real_user_text() {
                Some(format!("You: {}", r.text()))
            } else if r.is_assistant_text() {
                Some(format!("Bot: {}", r.text()))
            } else {
                None
            }
        })
        .collect();
    if lines.is_empty() {
        send(bridge, chat, "No history yet".to_string()).await;
        return Ok(());
    }
    let skip = lines.len().saturating_sub(HISTORY_TURNS);
    lines.drain(..skip);
    send(bridge, chat, lines.join("\n\n")).await;
    Ok(())
}

async fn show_model_picker(bridge: &Arc<Bridge>, chat: ChatId) {
    let current = bridge.registry.model().unwrap_or_else(|| "default".into());
    let keyboard: Keyboard = MODELS
        .iter()
        .map(|m| {
            let marker = if *m == current { "▶ " } else { "" };
            vec![Button::new(format!("{marker}{m}"), format!("model:{m}"))]
        })
        .collect();
    let msg = OutgoingMessage::text(format!("Current model: {current}")).with_keyboard(keyboard);
    let _ = bridge.chat.send(chat, msg).await;
}

async fn resume_command(bridge: &Arc<Bridge>, chat: ChatId, prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        // Bare /resume: most recent session on disk.
        let Some(info) = bridge.store.recent_sessions(1).into_iter().next() else {
            send(bridge, chat, "No sessions to resume".to_string()).await;
            return Ok(());
        };
        return switch_session(bridge, chat, info.id.clone(), info.workdir.clone()).await;
    }
    switch_by_prefix(bridge, chat, prefix).await
}

async fn switch_by_prefix(bridge: &Arc<Bridge>, chat: ChatId, prefix: &str) -> Result<()> {
    let Some(info) = bridge.store.find_by_prefix(prefix) else {
        return Err(BridgeError::SessionNotFound(prefix.to_string()));
    };
    switch_session(bridge, chat, info.id.clone(), info.workdir.clone()).await
}

async fn toggle_sync(bridge: &Arc<Bridge>, chat: ChatId) -> Result<()> {
    let current = bridge
        .registry
        .auto_sync()
        .unwrap_or(bridge.config.auto_sync);
    bridge.registry.set_auto_sync(!current)?;
    send(
        bridge,
        chat,
        format!(
            "Auto-sync {}",
            if current { "off" } else { "on — host activity will be mirrored here" }
        ),
    )
    .await;
    Ok(())
}

async fn show_project_sessions(bridge: &Arc<Bridge>, chat: ChatId, name: &str) {
    let Some(project) = bridge
        .store
        .list_projects()
        .into_iter()
        .find(|p| command_safe(&p.encoded) == name)
    else {
        send(bridge, chat, format!("Project not found: {name}")).await;
        return;
    };
    list_sessions(bridge, chat, Some(project.encoded.as_str())).await;
}

// ---------------------------------------------------------------------------
// Inline-keyboard callbacks
// ---------------------------------------------------------------------------

async fn handle_callback(
    bridge: &Arc<Bridge>,
    chat: ChatId,
    message_id: MessageId,
    data: &str,
) -> Result<()> {
    if let Some(id) = data.strip_prefix("sess:") {
        return switch_by_prefix(bridge, chat, id).await;
    }
    if let Some(encoded) = data.strip_prefix("proj:") {
        let mut keyboard: Keyboard = vec![vec![Button::new(
            "🆕 New session here",
            format!("newsess:{encoded}"),
        )]];
        let sessions = bridge.store.sessions_in_project(encoded, SESSION_LIST_LIMIT);
        for info in &sessions {
            keyboard.push(vec![
                Button::new(info.id.short().to_string(), format!("sess:{}", info.id.as_str())),
                Button::new("🗑", format!("sessdel:{}", info.id.as_str())),
            ]);
        }
        let msg = OutgoingMessage::text(format!(
            "📁 {} — {} session(s)",
            decode_project_dir(encoded).display(),
            sessions.len()
        ))
        .with_keyboard(keyboard);
        let _ = bridge.chat.send(chat, msg).await;
        return Ok(());
    }
    if let Some(encoded) = data.strip_prefix("newsess:") {
        return new_session(bridge, chat, Some(decode_project_dir(encoded))).await;
    }
    if let Some(id) = data.strip_prefix("sessdel:") {
        return delete_session(bridge, chat, id).await;
    }
    if let Some(rest) = data.strip_prefix("ask:") {
        return resolve_question(bridge, rest).await;
    }
    if let Some(rest) = data.strip_prefix("perm:") {
        return resolve_permission(bridge, rest).await;
    }
    if let Some(model) = data.strip_prefix("model:") {
        bridge.registry.set_model(model)?;
        // The next channel spawn picks the model up; a live one keeps its own.
        send(bridge, chat, format!("✅ Model set to {model}")).await;
        return Ok(());
    }
    if let Some(rest) = data.strip_prefix("takeover:") {
        return handle_takeover(bridge, chat, message_id, rest).await;
    }
    warn!(data, "unknown callback payload");
    Ok(())
}

async fn delete_session(bridge: &Arc<Bridge>, chat: ChatId, id: &str) -> Result<()> {
    let Some(info) = bridge.store.find_by_prefix(id) else {
        return Err(BridgeError::SessionNotFound(id.to_string()));
    };
    if let Some((_, channel)) = bridge.channels.remove(&info.id) {
        channel.close().await;
    }
    std::fs::remove_file(&info.path)?;
    info!(session = %info.id.short(), "session file deleted");
    send(bridge, chat, format!("🗑 Deleted session {}", info.id.short())).await;
    Ok(())
}

async fn resolve_question(bridge: &Arc<Bridge>, rest: &str) -> Result<()> {
    let Some((dialog_id, choice)) = rest.split_once(':') else {
        return Ok(());
    };
    let reply = if choice == "skip" {
        Reply::Skip
    } else {
        let index: usize = choice.parse().unwrap_or(usize::MAX);
        match bridge.pending.question_option(dialog_id, index) {
            Some(label) => Reply::Option(label),
            None => Reply::Skip,
        }
    };
    bridge.pending.resolve(dialog_id, reply);
    Ok(())
}

async fn resolve_permission(bridge: &Arc<Bridge>, rest: &str) -> Result<()> {
    let Some((dialog_id, action)) = rest.split_once(':') else {
        return Ok(());
    };
    let reply = match action {
        "allow" => Reply::Allow,
        "deny" => Reply::Deny,
        "tool" => Reply::AllowTool,
        "yolo" => Reply::Yolo,
        _ => return Ok(()),
    };
    bridge.pending.resolve(dialog_id, reply);
    Ok(())
}

async fn handle_takeover(
    bridge: &Arc<Bridge>,
    chat: ChatId,
    message_id: MessageId,
    rest: &str,
) -> Result<()> {
    if let Some(id) = rest.strip_prefix("dismiss:") {
        let session = SessionId::from_string(id);
        if let Some((notice_chat, notice_id)) = bridge.scanner.dismiss(&session) {
            let _ = bridge.chat.delete(notice_chat, notice_id).await;
        } else {
            // A watcher notice — delete the message the button sat on.
            bridge.watcher.take_notice(&session).await;
            let _ = bridge.chat.delete(chat, message_id).await;
        }
        return Ok(());
    }

    let session = SessionId::from_string(rest);
    // Rewrite whichever notification carried the button, preserving content.
    if let Some((notice_chat, notice_id, text)) = bridge.scanner.mark_continued(&session) {
        let _ = bridge
            .chat
            .edit(
                notice_chat,
                notice_id,
                OutgoingMessage::text(format!("{text}\n▶️ Continuing in Telegram")),
            )
            .await;
    } else if bridge.watcher.take_notice(&session).await.is_some() {
        let _ = bridge
            .chat
            .edit(
                chat,
                message_id,
                OutgoingMessage::text("▶️ Continuing in Telegram"),
            )
            .await;
    }
    takeover(bridge, chat, session).await
}

async fn send(bridge: &Arc<Bridge>, chat: ChatId, text: String) {
    let _ = bridge.chat.send(chat, OutgoingMessage::text(text)).await;
}
