//! The Permission Arbiter.
//!
//! Called by the Agent Channel for every tool invocation. Policy cascade,
//! first match wins: suppression → AskUserQuestion → yolo → per-session
//! allow-list → static settings rules → interactive dialog. Interactive
//! dialogs serialize on the bridge-wide permission gate so at most one is
//! visible per chat.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use remotecode_agent::{PermissionDecision, PermissionHandler, ToolPermissionRequest};
use remotecode_core::chat::{Button, OutgoingMessage};
use remotecode_core::types::SessionId;

use crate::pending::{InteractionKind, Reply, DIALOG_TIMEOUT};
use crate::render::tool_descriptor;
use crate::state::Bridge;

// ---------------------------------------------------------------------------
// Static settings rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Specifier {
    /// `Tool` — any invocation of the tool.
    Any,
    /// `Tool(exact)`.
    Exact(String),
    /// `Tool(prefix:*)`.
    Prefix(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    tool: String,
    specifier: Specifier,
}

impl Rule {
    /// Parse `Tool`, `Tool(exact)` or `Tool(prefix:*)`. Malformed entries
    /// yield `None` and are skipped.
    pub fn parse(raw: &str) -> Option<Rule> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.split_once('(') {
            None => Some(Rule {
                tool: raw.to_string(),
                specifier: Specifier::Any,
            }),
            Some((tool, rest)) => {
                let spec = rest.strip_suffix(')')?;
                let specifier = match spec.strip_suffix(":*") {
                    Some(prefix) => Specifier::Prefix(prefix.to_string()),
                    None => Specifier::Exact(spec.to_string()),
                };
                Some(Rule {
                    tool: tool.to_string(),
                    specifier,
                })
            }
        }
    }

    fn matches(&self, tool: &str, target: Option<&str>) -> bool {
        if self.tool != tool {
            return false;
        }
        match (&self.specifier, target) {
            (Specifier::Any, _) => true,
            (_, None) => false,
            (Specifier::Exact(spec), Some(target)) => {
                target == spec || first_word(target) == spec
            }
            (Specifier::Prefix(prefix), Some(target)) => {
                target == prefix || target.starts_with(&format!("{prefix} "))
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct RuleSet {
    pub allow: Vec<Rule>,
    pub deny: Vec<Rule>,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    permissions: SettingsPermissions,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsPermissions {
    #[serde(default)]
    allow: Vec<String>,
    #[serde(default)]
    deny: Vec<String>,
}

struct CachedRules {
    mtime: Option<SystemTime>,
    rules: Arc<RuleSet>,
}

/// Per-file rule cache keyed by mtime. A missing file caches as empty and is
/// re-probed on every lookup (mtime `None` never equals a real mtime).
#[derive(Default)]
pub struct SettingsCache {
    files: DashMap<PathBuf, CachedRules>,
}

impl SettingsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rules_for(&self, path: &Path) -> Arc<RuleSet> {
        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        if let Some(cached) = self.files.get(path) {
            if cached.mtime == mtime {
                return Arc::clone(&cached.rules);
            }
        }
        let rules = Arc::new(parse_settings_file(path));
        self.files.insert(
            path.to_path_buf(),
            CachedRules {
                mtime,
                rules: Arc::clone(&rules),
            },
        );
        rules
    }

    /// Evaluate the user-wide settings plus the two project files. Deny rules
    /// win over allow rules across all three.
    pub fn evaluate(
        &self,
        global: &Path,
        workdir: &Path,
        tool: &str,
        input: &Value,
    ) -> StaticDecision {
        let target = specifier_target(tool, input);
        let target = target.as_deref();
        let sources = [
            global.to_path_buf(),
            workdir.join(".claude").join("settings.json"),
            workdir.join(".claude").join("settings.local.json"),
        ];
        let sets: Vec<Arc<RuleSet>> = sources.iter().map(|p| self.rules_for(p)).collect();
        for set in &sets {
            if set.deny.iter().any(|r| r.matches(tool, target)) {
                return StaticDecision::Deny;
            }
        }
        for set in &sets {
            if set.allow.iter().any(|r| r.matches(tool, target)) {
                return StaticDecision::Allow;
            }
        }
        StaticDecision::NoMatch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticDecision {
    Allow,
    Deny,
    NoMatch,
}

fn parse_settings_file(path: &Path) -> RuleSet {
    let Ok(text) = std::fs::read_to_string(path) else {
        return RuleSet::default();
    };
    let parsed: SettingsFile = match serde_json::from_str(&text) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "unparseable settings file");
            return RuleSet::default();
        }
    };
    RuleSet {
        allow: parsed
            .permissions
            .allow
            .iter()
            .filter_map(|r| Rule::parse(r))
            .collect(),
        deny: parsed
            .permissions
            .deny
            .iter()
            .filter_map(|r| Rule::parse(r))
            .collect(),
    }
}

/// What a rule specifier is matched against, per tool.
fn specifier_target(tool: &str, input: &Value) -> Option<String> {
    match tool {
        "Bash" => input
            .get("command")
            .and_then(Value::as_str)
            .map(normalize_shell_command),
        "Edit" | "Write" | "Read" => input
            .get("file_path")
            .and_then(Value::as_str)
            .map(str::to_string),
        "WebFetch" => input.get("url").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Strip leading `NAME=value` environment assignments and the directory
/// prefix of the program word: `FOO=1 /usr/bin/git status` → `git status`.
pub fn normalize_shell_command(command: &str) -> String {
    let mut words = command.split_whitespace().peekable();
    while let Some(word) = words.peek() {
        if is_env_assignment(word) {
            words.next();
        } else {
            break;
        }
    }
    let Some(program) = words.next() else {
        return String::new();
    };
    let program = program.rsplit('/').next().unwrap_or(program);
    let rest: Vec<&str> = words.collect();
    if rest.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", rest.join(" "))
    }
}

fn is_env_assignment(word: &str) -> bool {
    match word.split_once('=') {
        None => false,
        Some((name, _)) => {
            !name.is_empty()
                && !name.starts_with(|c: char| c.is_ascii_digit())
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
    }
}

fn first_word(target: &str) -> &str {
    target.split_whitespace().next().unwrap_or(target)
}

// ---------------------------------------------------------------------------
// The arbiter
// ---------------------------------------------------------------------------

pub struct Arbiter {
    bridge: Weak<Bridge>,
}

impl Arbiter {
    pub fn new(bridge: Weak<Bridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl PermissionHandler for Arbiter {
    async fn on_tool_use(
        &self,
        request: ToolPermissionRequest,
        cancel: CancellationToken,
    ) -> PermissionDecision {
        let Some(bridge) = self.bridge.upgrade() else {
            return PermissionDecision::deny("shutting down");
        };
        let session = request.session_id.clone();
        let flags = bridge.flags(&session);

        // Deny-all fired earlier in this turn — everything else denies too.
        if flags.perm_denied.load(Ordering::SeqCst) {
            return PermissionDecision::deny("Denied by user");
        }

        // 1. Suppressed background session: allow silently so its stream
        //    unwinds without blocking on a dialog nobody can see.
        if flags.is_suppressed() {
            return PermissionDecision::allow();
        }

        // 2. Agent-asked question.
        if request.tool_name == "AskUserQuestion" {
            return ask_user_question(&bridge, &session, request, cancel).await;
        }

        // 3. Yolo (session or daemon-wide).
        if bridge.config.yolo || flags.is_yolo() {
            reveal(&bridge, &session, &request).await;
            return PermissionDecision::allow();
        }

        // 4. Per-session allow-list.
        if flags.tool_allowed(&request.tool_name) {
            reveal(&bridge, &session, &request).await;
            return PermissionDecision::allow();
        }

        // 5. Static settings rules.
        let workdir = bridge
            .registry
            .active_workdir()
            .unwrap_or_else(|| PathBuf::from("."));
        match bridge.settings.evaluate(
            &bridge.config.agent_settings,
            &workdir,
            &request.tool_name,
            &request.input,
        ) {
            StaticDecision::Allow => {
                reveal(&bridge, &session, &request).await;
                return PermissionDecision::allow();
            }
            StaticDecision::Deny => {
                info!(session = %session, tool = %request.tool_name, "denied by settings rule");
                return PermissionDecision::deny(format!(
                    "{} denied by settings rules",
                    request.tool_name
                ));
            }
            StaticDecision::NoMatch => {}
        }

        // 6. Interactive dialog.
        interactive_dialog(&bridge, &session, request, cancel).await
    }
}

async fn reveal(bridge: &Arc<Bridge>, session: &SessionId, request: &ToolPermissionRequest) {
    if let Some(ui) = bridge.turn_ui(session) {
        ui.tools
            .reveal(
                bridge.chat.as_ref(),
                request.tool_use_id.as_deref(),
                &request.tool_name,
            )
            .await;
    }
}

async fn interactive_dialog(
    bridge: &Arc<Bridge>,
    session: &SessionId,
    request: ToolPermissionRequest,
    cancel: CancellationToken,
) -> PermissionDecision {
    let Some(ui) = bridge.turn_ui(session) else {
        // No rendering surface (the turn is not orchestrator-driven).
        return PermissionDecision::deny("no interactive surface");
    };
    if ui.quiet {
        // Quiet turns (cancel wrap-ups) never get to ask for anything.
        return PermissionDecision::deny("no interactive surface");
    }
    let flags = bridge.flags(session);

    // One dialog visible at a time, bridge-wide.
    let _gate = bridge.permission_gate.lock().await;

    // A concurrent dialog's "Yolo for session" click (or a deny-all) may have
    // landed while we queued on the gate.
    if flags.perm_denied.load(Ordering::SeqCst) {
        return PermissionDecision::deny("Denied by user");
    }
    if flags.is_yolo() || flags.tool_allowed(&request.tool_name) {
        reveal(bridge, session, &request).await;
        return PermissionDecision::allow();
    }

    bridge.gate_busy.store(true, Ordering::SeqCst);
    let decision = run_dialog(bridge, session, &ui, request, cancel).await;
    bridge.gate_busy.store(false, Ordering::SeqCst);
    decision
}

async fn run_dialog(
    bridge: &Arc<Bridge>,
    session: &SessionId,
    ui: &Arc<crate::toolmsg::TurnUi>,
    request: ToolPermissionRequest,
    cancel: CancellationToken,
) -> PermissionDecision {
    let api = bridge.chat.as_ref();
    let flags = bridge.flags(session);
    let chat = ui.chat;
    let tool = request.tool_name.clone();

    // Context first: reveal the tool line, then flush buffered text so the
    // user reads what the Agent said before deciding.
    reveal(bridge, session, &request).await;
    ui.flush_text(api).await;

    let (dialog_id, rx) = bridge.pending.register(
        session,
        chat,
        InteractionKind::Permission { tool_name: tool.clone() },
    );

    let mut text = format!("Allow this tool?\n{}", tool_descriptor(&tool, &request.input));
    if let Some(reason) = &request.reason {
        text.push_str(&format!("\n{reason}"));
    }
    let keyboard = vec![
        vec![
            Button::new("✅ Allow", format!("perm:{dialog_id}:allow")),
            Button::new("❌ Deny", format!("perm:{dialog_id}:deny")),
        ],
        vec![Button::new(
            format!("✅ Allow {tool} for session"),
            format!("perm:{dialog_id}:tool"),
        )],
        vec![Button::new(
            "🚀 Yolo for session",
            format!("perm:{dialog_id}:yolo"),
        )],
    ];

    let message_id = match api
        .send(chat, OutgoingMessage::text(text).with_keyboard(keyboard))
        .await
    {
        Ok(id) => {
            bridge.pending.attach_message(&dialog_id, id);
            id
        }
        Err(e) => {
            warn!(error = %e, "permission dialog send failed");
            bridge.pending.discard(&dialog_id);
            return PermissionDecision::deny("dialog could not be shown");
        }
    };

    let reply = tokio::select! {
        reply = rx => reply.unwrap_or(Reply::DenyAll),
        _ = cancel.cancelled() => {
            bridge.pending.discard(&dialog_id);
            let _ = api
                .edit(chat, message_id, OutgoingMessage::text("🚫 Cancelled"))
                .await;
            return PermissionDecision::deny("Cancelled");
        }
        _ = tokio::time::sleep(DIALOG_TIMEOUT) => {
            bridge.pending.discard(&dialog_id);
            let _ = api
                .edit(chat, message_id, OutgoingMessage::text("⏰ Timed out"))
                .await;
            return PermissionDecision::deny("Permission request timed out");
        }
    };

    match reply {
        Reply::Allow => {
            let _ = api.delete(chat, message_id).await;
            ui.tools
                .append_status(api, format!("✓ Allowed {tool}"))
                .await;
            PermissionDecision::allow()
        }
        Reply::AllowTool => {
            flags.allow_tool(&tool);
            let _ = api.delete(chat, message_id).await;
            ui.tools
                .append_status(api, format!("✓ Allowed {tool} for session"))
                .await;
            PermissionDecision::allow()
        }
        Reply::Yolo => {
            flags.yolo.store(true, Ordering::SeqCst);
            let _ = api.delete(chat, message_id).await;
            ui.tools
                .append_status(api, "✓ Yolo enabled for session".to_string())
                .await;
            PermissionDecision::allow()
        }
        Reply::Deny => {
            let _ = api.delete(chat, message_id).await;
            ui.tools
                .append_status(api, format!("✗ Denied {tool}"))
                .await;
            PermissionDecision::deny(format!("User denied {tool}"))
        }
        Reply::DenyAll => {
            // The sweeper already edited the dialog message.
            PermissionDecision::deny("Cancelled by user")
        }
        Reply::Option(_) | Reply::Skip => PermissionDecision::deny("unexpected reply"),
    }
}

async fn ask_user_question(
    bridge: &Arc<Bridge>,
    session: &SessionId,
    request: ToolPermissionRequest,
    cancel: CancellationToken,
) -> PermissionDecision {
    let Some(ui) = bridge.turn_ui(session) else {
        return PermissionDecision::allow();
    };
    if ui.quiet {
        return PermissionDecision::allow();
    }
    let api = bridge.chat.as_ref();
    let chat = ui.chat;

    let question = request
        .input
        .get("question")
        .and_then(Value::as_str)
        .unwrap_or("The agent has a question")
        .to_string();
    let options = question_options(&request.input);

    let _gate = bridge.permission_gate.lock().await;
    bridge.gate_busy.store(true, Ordering::SeqCst);

    ui.flush_text(api).await;

    let (dialog_id, rx) = bridge.pending.register(
        session,
        chat,
        InteractionKind::Question {
            options: options.clone(),
        },
    );

    let mut keyboard: Vec<Vec<Button>> = options
        .iter()
        .enumerate()
        .map(|(i, label)| vec![Button::new(label.clone(), format!("ask:{dialog_id}:{i}"))])
        .collect();
    keyboard.push(vec![Button::new(
        "Skip answer",
        format!("ask:{dialog_id}:skip"),
    )]);

    let message_id = match api
        .send(
            chat,
            OutgoingMessage::text(format!("❓ {question}")).with_keyboard(keyboard),
        )
        .await
    {
        Ok(id) => {
            bridge.pending.attach_message(&dialog_id, id);
            id
        }
        Err(e) => {
            warn!(error = %e, "question dialog send failed");
            bridge.pending.discard(&dialog_id);
            bridge.gate_busy.store(false, Ordering::SeqCst);
            return PermissionDecision::allow();
        }
    };

    let reply = tokio::select! {
        reply = rx => reply.unwrap_or(Reply::Skip),
        _ = cancel.cancelled() => {
            bridge.pending.discard(&dialog_id);
            let _ = api
                .edit(chat, message_id, OutgoingMessage::text(format!("❓ {question}\n🚫 Cancelled")))
                .await;
            bridge.gate_busy.store(false, Ordering::SeqCst);
            return PermissionDecision::deny("Cancelled");
        }
        _ = tokio::time::sleep(DIALOG_TIMEOUT) => {
            bridge.pending.discard(&dialog_id);
            let _ = api
                .edit(chat, message_id, OutgoingMessage::text(format!("❓ {question}\n⏰ Timed out")))
                .await;
            bridge.gate_busy.store(false, Ordering::SeqCst);
            return PermissionDecision::deny("Question timed out");
        }
    };
    bridge.gate_busy.store(false, Ordering::SeqCst);

    match reply {
        Reply::Option(label) => {
            let _ = api
                .edit(
                    chat,
                    message_id,
                    OutgoingMessage::text(format!("❓ {question}\n→ {label}")),
                )
                .await;
            let mut updated = request.input.clone();
            updated["answer"] = Value::String(label);
            PermissionDecision::Allow {
                updated_input: Some(updated),
            }
        }
        Reply::Skip => {
            let _ = api
                .edit(
                    chat,
                    message_id,
                    OutgoingMessage::text(format!("❓ {question}\n↷ Skipped")),
                )
                .await;
            PermissionDecision::allow()
        }
        Reply::DenyAll => PermissionDecision::deny("Cancelled by user"),
        _ => PermissionDecision::allow(),
    }
}

fn question_options(input: &Value) -> Vec<String> {
    input
        .get("options")
        .and_then(Value::as_array)
        .map(|options| {
            options
                .iter()
                .filter_map(|o| match o {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(map) => map
                        .get("label")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Sweep every open dialog of `session` (cancel / busy switch): resolve deny,
/// edit each dialog message, and raise the per-session denied flag so later
/// callbacks in the same turn deny without UI.
pub async fn deny_all_dialogs(bridge: &Arc<Bridge>, session: &SessionId, edit_text: &str) {
    let flags = bridge.flags(session);
    flags.perm_denied.store(true, Ordering::SeqCst);
    for swept in bridge.pending.deny_all(session) {
        if let Some(message_id) = swept.message_id {
            let _ = bridge
                .chat
                .edit(swept.chat, message_id, OutgoingMessage::text(edit_text))
                .await;
        }
    }
}
