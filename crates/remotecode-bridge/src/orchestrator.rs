//! Per-chat-message dispatch and turn execution.
//!
//! A turn acquires its session's channel (creating or recreating it when
//! stale), streams events, and renders them. Queued turns drain strictly in
//! order; a session switched to the background keeps streaming silently and
//! keeps its queue until the user switches back.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use remotecode_agent::{AgentChannel, AgentEvent, AssistantBlock, ChannelOptions};
use remotecode_core::chat::OutgoingMessage;
use remotecode_core::types::{ChatId, MessageId, SessionId};
use remotecode_store::tail;

use crate::error::{BridgeError, Result};
use crate::pending::Reply;
use crate::permissions::deny_all_dialogs;
use crate::render::tool_descriptor;
use crate::state::{Bridge, QueuedTurn};
use crate::toolmsg::TurnUi;

/// Tools whose invocations never show up in the coalesced tool message.
const SILENT_TOOLS: &[&str] = &[
    "TodoWrite",
    "TaskCreate",
    "TaskUpdate",
    "TaskList",
    "TaskGet",
    "AskUserQuestion",
];

/// Grace after a turn before the active-query marker clears — trailing disk
/// writes from the Agent land within this window and must not look like
/// third-party activity.
const PROCESSING_CLEAR_DELAY: Duration = Duration::from_secs(2);

/// How long /cancel keeps the session suppressed to swallow post-interrupt
/// chatter.
const CANCEL_SUPPRESS: Duration = Duration::from_secs(5);

const CLEANUP_PROMPT: &str =
    "The user cancelled the current task. Stop what you are doing, leave the \
     working tree in a consistent state, and reply with a one-line summary of \
     where you stopped.";

/// Resolve the active session, creating one implicitly on first use.
pub fn resolve_session(bridge: &Arc<Bridge>) -> Result<(SessionId, PathBuf)> {
    let workdir = bridge
        .registry
        .active_workdir()
        .or_else(|| std::env::current_dir().ok())
        .ok_or(BridgeError::MissingWorkdir)?;
    if !workdir.exists() {
        return Err(BridgeError::WorkdirGone(
            workdir.to_string_lossy().into_owned(),
        ));
    }
    match bridge.registry.active_session() {
        Some(id) => Ok((id, workdir)),
        None => {
            let id = SessionId::generate();
            bridge.registry.set_active(&id, &workdir)?;
            info!(session = %id, workdir = %workdir.display(), "created session implicitly");
            Ok((id, workdir))
        }
    }
}

/// Entry point for a user prompt (typed text, image caption, transcribed
/// voice note).
pub async fn submit_prompt(
    bridge: &Arc<Bridge>,
    chat: ChatId,
    reply_to: Option<MessageId>,
    prompt: String,
    voice: bool,
    attachments: Vec<PathBuf>,
) -> Result<()> {
    let (session, _workdir) = resolve_session(bridge)?;
    let turn = QueuedTurn {
        chat,
        prompt,
        reply_to,
        voice,
        quiet: false,
        attachments,
    };

    if bridge.is_processing(&session) {
        // An open AskUserQuestion absorbs the text as its answer.
        if let Some(dialog_id) = bridge.pending.question_for(&session) {
            if bridge
                .pending
                .resolve(&dialog_id, Reply::Option(turn.prompt.clone()))
                .is_some()
            {
                if let (Some(ui), Some(reply)) = (bridge.turn_ui(&session), reply_to) {
                    ui.advance_reply_to(reply);
                }
                return Ok(());
            }
        }
        let had_dialog = bridge.pending.has_dialog(&session);
        bridge.enqueue_turn(&session, turn);
        debug!(session = %session, queued = bridge.queue_len(&session), "session busy, turn queued");
        if had_dialog {
            // Unblock the stream so the queue can drain.
            deny_all_dialogs(bridge, &session, "🚫 Cancelled (new message arrived)").await;
        }
        return Ok(());
    }

    // Idle: run behind anything still parked in the queue so enqueue order
    // is preserved even across the post-turn grace window.
    bridge.enqueue_turn(&session, turn);
    let Some(first) = bridge.dequeue_turn(&session) else {
        return Ok(());
    };
    let bridge = Arc::clone(bridge);
    tokio::spawn(async move {
        run_session_turns(bridge, session, first).await;
    });
    Ok(())
}

/// Run one turn, then drain the session's queue while it stays active.
pub async fn run_session_turns(bridge: Arc<Bridge>, session: SessionId, first: QueuedTurn) {
    let mut turn = first;
    loop {
        run_turn(&bridge, &session, turn).await;

        // Background sessions keep their queue until the user switches back.
        if bridge.active_session().as_ref() != Some(&session) {
            break;
        }
        match bridge.dequeue_turn(&session) {
            Some(next) => turn = next,
            None => break,
        }
    }
}

struct StreamOutcome {
    saw_event: bool,
    got_result: bool,
    is_error: bool,
    errors: Vec<String>,
    /// Set when the Agent re-keyed the session (resume).
    new_session_id: Option<String>,
}

fn run_turn<'a>(
    bridge: &'a Arc<Bridge>,
    session: &'a SessionId,
    turn: QueuedTurn,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
    Box::pin(run_turn_inner(bridge, session, turn))
}

async fn run_turn_inner(bridge: &Arc<Bridge>, session: &SessionId, turn: QueuedTurn) {
    let generation = bridge.mark_processing(session);
    let flags = bridge.flags(session);
    flags.perm_denied.store(false, Ordering::SeqCst);

    let ui = TurnUi::new(turn.chat, turn.reply_to, turn.quiet);
    bridge.turn_ui.insert(session.clone(), Arc::clone(&ui));

    let outcome = stream_with_recovery(bridge, session, &turn, &ui).await;

    match outcome {
        Ok(outcome) => {
            finish_turn(bridge, session, &turn, &ui, outcome).await;
        }
        Err(e) => {
            warn!(session = %session, error = %e, "turn failed");
            if !flags.is_suppressed() && !turn.quiet {
                let _ = bridge
                    .chat
                    .send(turn.chat, OutgoingMessage::text(format!("⚠️ {e}")))
                    .await;
            }
        }
    }

    for path in &turn.attachments {
        let _ = std::fs::remove_file(path);
    }
    bridge
        .turn_ui
        .remove_if(session, |_, current| Arc::ptr_eq(current, &ui));

    // Deferred cleanup: clear the marker after the Agent's trailing disk
    // writes, drain anything enqueued during the grace window, and close the
    // channel if the session went background and idle.
    let bridge = Arc::clone(bridge);
    let session = session.clone();
    tokio::spawn(async move {
        tokio::time::sleep(PROCESSING_CLEAR_DELAY).await;
        bridge.clear_processing(&session, generation);

        let background = bridge.active_session().as_ref() != Some(&session);
        if !background && !bridge.is_processing(&session) {
            if let Some(next) = bridge.dequeue_turn(&session) {
                // Boxed: this re-enters the turn loop from inside a turn's
                // own cleanup task.
                let drain: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
                    Box::pin(run_session_turns(Arc::clone(&bridge), session.clone(), next));
                drain.await;
            }
            return;
        }
        if background && bridge.queue_len(&session) == 0 && !bridge.is_processing(&session) {
            if let Some((_, channel)) = bridge.channels.remove(&session) {
                info!(session = %session, "closing background channel");
                channel.close().await;
            }
        }
    });
}

async fn stream_with_recovery(
    bridge: &Arc<Bridge>,
    session: &SessionId,
    turn: &QueuedTurn,
    ui: &Arc<TurnUi>,
) -> Result<StreamOutcome> {
    let channel = channel_for(bridge, session, false).await?;
    let outcome = drive_stream(bridge, session, &channel, turn, ui).await?;
    if outcome.saw_event || channel.was_interrupted() {
        return Ok(outcome);
    }

    // The process died before producing anything — a corrupted record makes
    // resume fail this way. Recreate once as a fresh session.
    warn!(session = %session, "agent produced no events, recreating fresh");
    if let Some((_, dead)) = bridge.channels.remove(session) {
        dead.close().await;
    }
    let channel = channel_for(bridge, session, true).await?;
    drive_stream(bridge, session, &channel, turn, ui).await
}

async fn drive_stream(
    bridge: &Arc<Bridge>,
    session: &SessionId,
    channel: &Arc<AgentChannel>,
    turn: &QueuedTurn,
    ui: &Arc<TurnUi>,
) -> Result<StreamOutcome> {
    let flags = bridge.flags(session);
    let api = bridge.chat.as_ref();

    let typing = spawn_typing(bridge, session, turn.chat, turn.quiet);

    let mut stream = channel.begin_turn(&turn.prompt).await?;
    let mut outcome = StreamOutcome {
        saw_event: false,
        got_result: false,
        is_error: false,
        errors: Vec::new(),
        new_session_id: None,
    };

    while let Some(event) = stream.next().await {
        outcome.saw_event = true;
        let renderable = !flags.is_suppressed() && !turn.quiet;
        match event {
            AgentEvent::SystemInit { session_id } => {
                if !session_id.is_empty() && session_id != session.as_str() {
                    outcome.new_session_id = Some(session_id);
                }
            }
            AgentEvent::Assistant { blocks } => {
                for block in blocks {
                    match block {
                        AssistantBlock::Text(text) => ui.push_text(&text).await,
                        AssistantBlock::ToolUse { id, name, input } => {
                            if SILENT_TOOLS.contains(&name.as_str()) || !renderable {
                                continue;
                            }
                            let reveal = bridge.config.yolo || flags.is_yolo();
                            ui.tools
                                .add_block(
                                    api,
                                    Some(id),
                                    &name,
                                    tool_descriptor(&name, &input),
                                    reveal,
                                )
                                .await;
                        }
                    }
                }
            }
            AgentEvent::TaskStarted { description } => {
                if renderable {
                    let _ = api
                        .send(
                            turn.chat,
                            OutgoingMessage::text(format!("🤖 Task started: {description}")),
                        )
                        .await;
                }
            }
            AgentEvent::TaskNotification { status, summary } => {
                if renderable {
                    let _ = api
                        .send(
                            turn.chat,
                            OutgoingMessage::text(format!("📋 {summary} ({status})")),
                        )
                        .await;
                }
            }
            AgentEvent::Result { is_error, errors } => {
                outcome.got_result = true;
                outcome.is_error = is_error;
                outcome.errors = errors;
                break;
            }
        }
    }

    typing.abort();
    Ok(outcome)
}

async fn finish_turn(
    bridge: &Arc<Bridge>,
    session: &SessionId,
    turn: &QueuedTurn,
    ui: &Arc<TurnUi>,
    outcome: StreamOutcome,
) {
    let flags = bridge.flags(session);
    let channel = bridge.channel(session);
    let interrupted = channel.as_ref().map(|c| c.was_interrupted()).unwrap_or(false);
    let renderable = !flags.is_suppressed() && !turn.quiet;

    if outcome.is_error && !interrupted && renderable {
        let detail = if outcome.errors.is_empty() {
            "agent reported an error".to_string()
        } else {
            outcome.errors.join("; ")
        };
        let _ = bridge
            .chat
            .send(turn.chat, OutgoingMessage::text(format!("⚠️ {detail}")))
            .await;
    }

    // Final assistant text, replying to the most recent user target.
    if renderable {
        let mut text = ui.take_text().await;
        if !text.is_empty() {
            if turn.voice {
                text = format!("🔊 {text}");
            }
            let msg = OutgoingMessage::markdown(text).reply_to(ui.reply_to());
            let _ = bridge.chat.send(turn.chat, msg).await;
        }
    } else {
        // Background sessions finish without chatter.
        let _ = ui.take_text().await;
    }

    // The Agent re-keyed the session on resume: move in-memory state to the
    // new id and persist it if this session is still the active one.
    if let Some(new_id) = outcome.new_session_id {
        remap_session(bridge, session, new_id).await;
    }

    if let Some(channel) = bridge.channel(session) {
        channel.record_self_size();
    }
    // The watcher must not re-emit what was just streamed live.
    bridge.watcher.skip_to_end(session).await;
}

async fn remap_session(bridge: &Arc<Bridge>, old: &SessionId, new_id: String) {
    let new = SessionId::from_string(new_id);
    info!(old = %old, new = %new, "agent re-keyed session");
    if let Some((_, channel)) = bridge.channels.remove(old) {
        if let Some(workdir) = bridge.registry.active_workdir() {
            channel.set_record_file(bridge.store.session_file(&workdir, &new));
        }
        bridge.channels.insert(new.clone(), channel);
    }
    if bridge.active_session().as_ref() == Some(old) {
        if let Some(workdir) = bridge.registry.active_workdir() {
            let _ = bridge.registry.set_active(&new, &workdir);
        }
    }
}

/// Get the live channel for `session`, recreating a stale one and spawning
/// on first use.
async fn channel_for(
    bridge: &Arc<Bridge>,
    session: &SessionId,
    force_fresh: bool,
) -> Result<Arc<AgentChannel>> {
    if let Some(channel) = bridge.channel(session) {
        if !channel.is_stale() && !force_fresh {
            return Ok(channel);
        }
        info!(session = %session, "channel stale, recreating");
        bridge.channels.remove(session);
        channel.close().await;
    }

    let workdir = bridge
        .registry
        .active_workdir()
        .or_else(|| std::env::current_dir().ok())
        .ok_or(BridgeError::MissingWorkdir)?;
    let options = ChannelOptions {
        agent_bin: bridge.config.agent_bin.clone(),
        model: bridge.registry.model(),
        workdir: workdir.clone(),
        record_file: bridge.store.session_file(&workdir, session),
        force_fresh,
    };
    let channel = AgentChannel::spawn(
        session.clone(),
        options,
        Arc::clone(&bridge.arbiter) as Arc<dyn remotecode_agent::PermissionHandler>,
    )?;
    bridge
        .channels
        .insert(session.clone(), Arc::clone(&channel));
    Ok(channel)
}

fn spawn_typing(
    bridge: &Arc<Bridge>,
    session: &SessionId,
    chat: ChatId,
    quiet: bool,
) -> tokio::task::JoinHandle<()> {
    let bridge = Arc::clone(bridge);
    let session = session.clone();
    tokio::spawn(async move {
        if quiet {
            return;
        }
        loop {
            let flags = bridge.flags(&session);
            // Paused while a permission dialog is on screen.
            if !bridge.gate_busy.load(Ordering::SeqCst) && !flags.is_suppressed() {
                let _ = bridge.chat.typing(chat).await;
            }
            tokio::time::sleep(Duration::from_secs(4)).await;
        }
    })
}

/// `/cancel`: sweep dialogs, clear the queue, interrupt the Agent, and queue
/// a quiet wrap-up prompt.
pub async fn cancel_active(bridge: &Arc<Bridge>, chat: ChatId) {
    let Some(session) = bridge.active_session() else {
        let _ = bridge
            .chat
            .send(chat, OutgoingMessage::text("Nothing to cancel"))
            .await;
        return;
    };

    deny_all_dialogs(bridge, &session, "🚫 Cancelled").await;
    bridge.clear_queue(&session);

    let busy = bridge.is_processing(&session);
    if busy {
        let flags = bridge.flags(&session);
        flags.suppressed.store(true, Ordering::SeqCst);
        if let Some(channel) = bridge.channel(&session) {
            channel.interrupt();
        }
        // Wrap-up prompt drains after the interrupted turn; its own failure
        // stays invisible (quiet).
        bridge.enqueue_turn(
            &session,
            QueuedTurn {
                chat,
                prompt: CLEANUP_PROMPT.to_string(),
                reply_to: None,
                voice: false,
                quiet: true,
                attachments: Vec::new(),
            },
        );

        let bridge2 = Arc::clone(bridge);
        let session2 = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CANCEL_SUPPRESS).await;
            if bridge2.active_session().as_ref() == Some(&session2) {
                bridge2
                    .flags(&session2)
                    .suppressed
                    .store(false, Ordering::SeqCst);
            }
        });
    }

    let _ = bridge
        .chat
        .send(chat, OutgoingMessage::text("🛑 Task cancelled"))
        .await;
}

/// Switch the active selection from the current session to `new`.
pub async fn switch_session(
    bridge: &Arc<Bridge>,
    chat: ChatId,
    new: SessionId,
    workdir: PathBuf,
) -> Result<()> {
    let old = bridge.active_session();
    if old.as_ref() == Some(&new) {
        let _ = bridge
            .chat
            .send(chat, OutgoingMessage::text("Already the active session"))
            .await;
        return Ok(());
    }

    if let Some(old) = old {
        let old_flags = bridge.flags(&old);
        if bridge.is_processing(&old) {
            // Let the old stream finish silently: suppress its rendering and
            // auto-allow its remaining tool-uses so nothing blocks.
            old_flags.suppressed.store(true, Ordering::SeqCst);
            old_flags.yolo.store(true, Ordering::SeqCst);
            deny_all_dialogs(bridge, &old, "🚫 Cancelled (session switched)").await;
            info!(session = %old, "busy session moved to background");
        } else {
            old_flags.clear();
            deny_all_dialogs(bridge, &old, "🚫 Cancelled (session switched)").await;
        }
    }

    bridge
        .flags(&new)
        .suppressed
        .store(false, Ordering::SeqCst);
    bridge.registry.set_active(&new, &workdir)?;

    let record = bridge.store.session_file(&workdir, &new);
    let preview = bridge.store.preview(&record).unwrap_or_default();
    let _ = bridge
        .chat
        .send(
            chat,
            OutgoingMessage::text(format!(
                "📌 Switched to {} {}",
                new.short(),
                if preview.is_empty() {
                    String::new()
                } else {
                    format!("— {preview}")
                }
            )),
        )
        .await;

    // A queue parked while the session was background drains now.
    if !bridge.is_processing(&new) {
        if let Some(next) = bridge.dequeue_turn(&new) {
            let bridge = Arc::clone(bridge);
            let new = new.clone();
            tokio::spawn(async move {
                run_session_turns(bridge, new, next).await;
            });
        }
    }
    Ok(())
}

/// Takeover handoff: pull a host-driven session into the chat and replay its
/// last user prompt through the interactive permission flow.
pub async fn takeover(bridge: &Arc<Bridge>, chat: ChatId, session: SessionId) -> Result<()> {
    let Some(info) = bridge.store.find_by_prefix(session.as_str()) else {
        return Err(BridgeError::SessionNotFound(session.short().to_string()));
    };

    if let Some(channel) = bridge.channel(&session) {
        channel.mark_stale();
    }
    switch_session(bridge, chat, session.clone(), info.workdir.clone()).await?;

    match tail::last_user_text(&info.path) {
        Some(prompt) => submit_prompt(bridge, chat, None, prompt, false, Vec::new()).await,
        None => {
            let _ = bridge
                .chat
                .send(
                    chat,
                    OutgoingMessage::text("No user prompt found to continue from"),
                )
                .await;
            Ok(())
        }
    }
}
