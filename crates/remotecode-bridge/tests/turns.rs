//! End-to-end orchestrator behavior against scripted fake agents and a
//! recording chat transport.

mod support;

use std::sync::Arc;

use remotecode_bridge::orchestrator::{submit_prompt, switch_session};
use remotecode_bridge::commands::handle_update;
use remotecode_core::chat::ChatUpdate;
use remotecode_core::types::{ChatId, MessageId, SessionId};

use support::{fixture, wait_for, COUNTER_AGENT, SLOW_AGENT, TEXT_AGENT, TOOL_AGENT};

const CHAT: ChatId = ChatId(7);

#[tokio::test]
async fn happy_path_text_turn() {
    let fx = fixture(TEXT_AGENT, false);
    fx.bridge
        .registry
        .set_active(&SessionId::generate(), &fx.workdir)
        .unwrap();

    submit_prompt(
        &fx.bridge,
        CHAT,
        Some(MessageId(1)),
        "hello".to_string(),
        false,
        Vec::new(),
    )
    .await
    .unwrap();

    let chat = Arc::clone(&fx.chat);
    wait_for(|| chat.any_sent("All set."), "final assistant text").await;

    // Session selection persisted.
    assert!(fx.bridge.registry.active_session().is_some());
    assert_eq!(fx.bridge.registry.active_workdir(), Some(fx.workdir.clone()));

    // No permission dialog appeared.
    assert!(fx.chat.dialog_with_prefix("perm:").is_none());
}

#[tokio::test]
async fn implicit_session_created_on_first_prompt() {
    let fx = fixture(TEXT_AGENT, false);
    // Empty registry: resolve_session must mint a session id. The workdir
    // falls back to the test process cwd, which exists.
    assert!(fx.bridge.registry.active_session().is_none());

    submit_prompt(&fx.bridge, CHAT, None, "hello".to_string(), false, Vec::new())
        .await
        .unwrap();

    let chat = Arc::clone(&fx.chat);
    wait_for(|| chat.any_sent("All set."), "final assistant text").await;
    assert!(fx.bridge.registry.active_session().is_some());
    assert!(fx.bridge.registry.active_workdir().is_some());
}

#[tokio::test]
async fn yolo_tool_use_renders_without_dialog() {
    let fx = fixture(TOOL_AGENT, true);
    fx.bridge
        .registry
        .set_active(&SessionId::generate(), &fx.workdir)
        .unwrap();

    submit_prompt(&fx.bridge, CHAT, None, "list files".to_string(), false, Vec::new())
        .await
        .unwrap();

    let chat = Arc::clone(&fx.chat);
    wait_for(|| chat.any_sent("done"), "final text after tool").await;

    assert!(fx.chat.any_sent("🔧 Bash: ls"), "tool descriptor missing");
    assert!(fx.chat.dialog_with_prefix("perm:").is_none(), "dialog in yolo mode");
    // One coalesced tool message, not one per block.
    let tool_messages = fx
        .chat
        .texts()
        .iter()
        .filter(|t| t.contains("🔧 Bash"))
        .count();
    assert_eq!(tool_messages, 1);
}

#[tokio::test]
async fn interactive_allow_flow() {
    let fx = fixture(TOOL_AGENT, false);
    fx.bridge
        .registry
        .set_active(&SessionId::generate(), &fx.workdir)
        .unwrap();

    submit_prompt(&fx.bridge, CHAT, None, "grep TODO".to_string(), false, Vec::new())
        .await
        .unwrap();

    let chat = Arc::clone(&fx.chat);
    wait_for(|| chat.dialog_with_prefix("perm:").is_some(), "permission dialog").await;
    let dialog = fx.chat.dialog_with_prefix("perm:").unwrap();

    // Four choices: allow, deny, allow-for-session, yolo.
    let buttons: Vec<String> = dialog
        .keyboard
        .as_ref()
        .unwrap()
        .iter()
        .flatten()
        .map(|b| b.data.clone())
        .collect();
    assert_eq!(buttons.len(), 4);
    let allow = buttons.iter().find(|d| d.ends_with(":allow")).unwrap().clone();

    // The tool descriptor was revealed before the dialog.
    assert!(fx.chat.any_sent("🔧 Bash: ls"));

    handle_update(
        Arc::clone(&fx.bridge),
        ChatUpdate::Callback {
            chat: CHAT,
            message_id: dialog.id,
            callback_id: "cb1".to_string(),
            data: allow,
        },
    )
    .await;

    let chat = Arc::clone(&fx.chat);
    wait_for(|| chat.any_sent("done"), "final text after allow").await;

    // Dialog deleted, status line appended to the tool message.
    assert!(fx.chat.deleted.lock().unwrap().contains(&dialog.id));
    let chat = Arc::clone(&fx.chat);
    wait_for(|| chat.any_edit("✓ Allowed Bash"), "allowed status line").await;
}

#[tokio::test]
async fn cancel_denies_dialog_and_clears_queue() {
    let fx = fixture(TOOL_AGENT, false);
    let session = SessionId::generate();
    fx.bridge.registry.set_active(&session, &fx.workdir).unwrap();

    submit_prompt(&fx.bridge, CHAT, None, "grep TODO".to_string(), false, Vec::new())
        .await
        .unwrap();

    let chat = Arc::clone(&fx.chat);
    wait_for(|| chat.dialog_with_prefix("perm:").is_some(), "permission dialog").await;

    handle_update(
        Arc::clone(&fx.bridge),
        ChatUpdate::Text {
            chat: CHAT,
            message_id: MessageId(99),
            text: "/cancel".to_string(),
        },
    )
    .await;

    let chat = Arc::clone(&fx.chat);
    wait_for(|| chat.any_edit("🚫 Cancelled"), "dialog swept to cancelled").await;
    assert!(fx.chat.any_sent("🛑 Task cancelled"));

    // The cancelled turn's output is suppressed.
    let chat = Arc::clone(&fx.chat);
    let bridge = Arc::clone(&fx.bridge);
    let session2 = session.clone();
    wait_for(
        move || !bridge.is_processing(&session2) && bridge.queue_len(&session2) == 0,
        "turn teardown",
    )
    .await;
    assert!(!chat.any_sent("done"), "suppressed turn output leaked");
}

#[tokio::test]
async fn stale_channel_is_recreated_on_next_prompt() {
    let fx = fixture(TEXT_AGENT, false);
    let session = SessionId::generate();
    fx.bridge.registry.set_active(&session, &fx.workdir).unwrap();

    // Seed the record file so sizes are non-zero on both sides.
    let record = fx.bridge.store.session_file(&fx.workdir, &session);
    std::fs::create_dir_all(record.parent().unwrap()).unwrap();
    std::fs::write(&record, b"{\"type\":\"user\",\"message\":{\"role\":\"user\",\"content\":\"x\"}}\n").unwrap();

    submit_prompt(&fx.bridge, CHAT, None, "first".to_string(), false, Vec::new())
        .await
        .unwrap();
    let chat = Arc::clone(&fx.chat);
    wait_for(|| chat.any_sent("All set."), "first turn").await;

    let bridge = Arc::clone(&fx.bridge);
    let session2 = session.clone();
    wait_for(
        move || {
            bridge
                .channel(&session2)
                .is_some_and(|c| c.last_self_size() > 0)
        },
        "self size recorded",
    )
    .await;
    let first_channel = fx.bridge.channel(&session).unwrap();
    assert!(!first_channel.is_stale());

    // Third-party append.
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().append(true).open(&record).unwrap();
    writeln!(file, "{{\"type\":\"user\",\"message\":{{\"role\":\"user\",\"content\":\"host turn\"}}}}").unwrap();
    assert!(first_channel.is_stale());

    submit_prompt(&fx.bridge, CHAT, None, "second".to_string(), false, Vec::new())
        .await
        .unwrap();
    let chat = Arc::clone(&fx.chat);
    wait_for(
        move || chat.texts().iter().filter(|t| t.contains("All set.")).count() >= 2,
        "second turn",
    )
    .await;

    let second_channel = fx.bridge.channel(&session).unwrap();
    assert!(
        !Arc::ptr_eq(&first_channel, &second_channel),
        "stale channel was reused"
    );
}

#[tokio::test]
async fn switch_mid_stream_suppresses_old_session_output() {
    let fx = fixture(SLOW_AGENT, false);
    let session_a = SessionId::generate();
    fx.bridge.registry.set_active(&session_a, &fx.workdir).unwrap();

    submit_prompt(&fx.bridge, CHAT, None, "long job".to_string(), false, Vec::new())
        .await
        .unwrap();

    let bridge = Arc::clone(&fx.bridge);
    let a = session_a.clone();
    wait_for(move || bridge.is_processing(&a), "turn start").await;

    let session_b = SessionId::generate();
    switch_session(&fx.bridge, CHAT, session_b.clone(), fx.workdir.clone())
        .await
        .unwrap();
    assert!(fx.chat.any_sent("📌 Switched to"));

    // Wait past the slow agent's reply plus the close grace.
    let bridge = Arc::clone(&fx.bridge);
    let a = session_a.clone();
    wait_for(
        move || !bridge.is_processing(&a) && bridge.channel(&a).is_none(),
        "background channel closed",
    )
    .await;

    assert!(
        !fx.chat.any_sent("slow answer"),
        "suppressed session output reached the chat"
    );
}

#[tokio::test]
async fn queued_turns_drain_in_order() {
    let fx = fixture(COUNTER_AGENT, false);
    let session = SessionId::generate();
    fx.bridge.registry.set_active(&session, &fx.workdir).unwrap();

    submit_prompt(&fx.bridge, CHAT, None, "one".to_string(), false, Vec::new())
        .await
        .unwrap();
    let bridge = Arc::clone(&fx.bridge);
    let sid = session.clone();
    wait_for(move || bridge.is_processing(&sid), "first turn start").await;

    submit_prompt(&fx.bridge, CHAT, None, "two".to_string(), false, Vec::new())
        .await
        .unwrap();
    assert_eq!(fx.bridge.queue_len(&session), 1, "second turn not queued");

    let chat = Arc::clone(&fx.chat);
    wait_for(|| chat.any_sent("reply 2"), "second reply").await;

    let replies: Vec<String> = fx
        .chat
        .texts()
        .into_iter()
        .filter(|t| t.starts_with("reply"))
        .collect();
    assert_eq!(replies, vec!["reply 1", "reply 2"]);
    assert_eq!(fx.bridge.queue_len(&session), 0);
}
