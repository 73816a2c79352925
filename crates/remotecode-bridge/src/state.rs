//! Shared bridge state.
//!
//! One `Arc<Bridge>` is passed to every task: update handlers, per-session
//! turn tasks, the watcher, and the scanner. Registries are per-session
//! `DashMap`s so unrelated sessions never serialize on one lock.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use remotecode_agent::AgentChannel;
use remotecode_core::chat::ChatApi;
use remotecode_core::config::Config;
use remotecode_core::registry::SessionRegistry;
use remotecode_core::types::{ChatId, MessageId, SessionId};
use remotecode_store::ConversationStore;

use crate::pending::PendingInteractions;
use crate::permissions::{Arbiter, SettingsCache};
use crate::scanner::ScannerShared;
use crate::toolmsg::TurnUi;
use crate::transcribe::Transcriber;
use crate::watcher::WatcherShared;

/// Per-session policy and rendering flags. Kept outside the channel so they
/// survive channel recreation and exist for sessions without a live channel.
#[derive(Debug, Default)]
pub struct SessionFlags {
    /// Auto-allow every tool invocation for this session.
    pub yolo: AtomicBool,
    /// Render nothing from this session to chat (background after a switch).
    pub suppressed: AtomicBool,
    /// Deny-all fired mid-turn: further tool callbacks deny without UI until
    /// the next turn starts.
    pub perm_denied: AtomicBool,
    pub allowed_tools: std::sync::Mutex<HashSet<String>>,
}

impl SessionFlags {
    pub fn is_yolo(&self) -> bool {
        self.yolo.load(Ordering::SeqCst)
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::SeqCst)
    }

    pub fn tool_allowed(&self, tool: &str) -> bool {
        self.allowed_tools.lock().unwrap().contains(tool)
    }

    pub fn allow_tool(&self, tool: &str) {
        self.allowed_tools.lock().unwrap().insert(tool.to_string());
    }

    /// Reset session-local policy (idle switch-away).
    pub fn clear(&self) {
        self.yolo.store(false, Ordering::SeqCst);
        self.suppressed.store(false, Ordering::SeqCst);
        self.perm_denied.store(false, Ordering::SeqCst);
        self.allowed_tools.lock().unwrap().clear();
    }
}

/// One queued turn, drained strictly in order.
#[derive(Debug, Clone)]
pub struct QueuedTurn {
    pub chat: ChatId,
    pub prompt: String,
    pub reply_to: Option<MessageId>,
    pub voice: bool,
    /// Render nothing from this turn (cancel cleanup prompts).
    pub quiet: bool,
    /// Tempfiles (downloaded images/audio) deleted when the turn ends.
    pub attachments: Vec<PathBuf>,
}

pub struct Bridge {
    pub config: Config,
    pub registry: SessionRegistry,
    pub store: ConversationStore,
    pub chat: Arc<dyn ChatApi>,
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub arbiter: Arc<Arbiter>,
    pub settings: SettingsCache,
    pub pending: PendingInteractions,
    pub watcher: WatcherShared,
    pub scanner: ScannerShared,

    /// Live agent channels by session.
    pub(crate) channels: DashMap<SessionId, Arc<AgentChannel>>,
    flags: DashMap<SessionId, Arc<SessionFlags>>,
    queues: DashMap<SessionId, VecDeque<QueuedTurn>>,
    /// The "active query" marker: sessions with a streaming orchestrator
    /// turn, tagged with a generation so the deferred clear never removes a
    /// newer turn's marker.
    processing: DashMap<SessionId, u64>,
    generation: AtomicU64,

    /// Serializes interactive permission dialogs across all sessions of the
    /// chat (at most one dialog visible at a time).
    pub(crate) permission_gate: tokio::sync::Mutex<()>,
    /// Set while a dialog is on screen — the typing indicator pauses.
    pub(crate) gate_busy: AtomicBool,

    /// Per-turn rendering state, shared with the arbiter for reveal/flush.
    pub(crate) turn_ui: DashMap<SessionId, Arc<TurnUi>>,

    pub shutdown: CancellationToken,
}

impl Bridge {
    pub fn new(
        config: Config,
        chat: Arc<dyn ChatApi>,
        transcriber: Option<Arc<dyn Transcriber>>,
    ) -> Arc<Self> {
        let registry = SessionRegistry::new(config.registry_path());
        let store = ConversationStore::new(config.projects_root.clone());
        Arc::new_cyclic(|weak| Self {
            registry,
            store,
            chat,
            transcriber,
            arbiter: Arc::new(Arbiter::new(weak.clone())),
            settings: SettingsCache::new(),
            pending: PendingInteractions::new(),
            watcher: WatcherShared::new(),
            scanner: ScannerShared::new(),
            channels: DashMap::new(),
            flags: DashMap::new(),
            queues: DashMap::new(),
            processing: DashMap::new(),
            generation: AtomicU64::new(0),
            permission_gate: tokio::sync::Mutex::new(()),
            gate_busy: AtomicBool::new(false),
            turn_ui: DashMap::new(),
            shutdown: CancellationToken::new(),
            config,
        })
    }

    pub fn flags(&self, session: &SessionId) -> Arc<SessionFlags> {
        self.flags
            .entry(session.clone())
            .or_insert_with(|| Arc::new(SessionFlags::default()))
            .clone()
    }

    pub fn channel(&self, session: &SessionId) -> Option<Arc<AgentChannel>> {
        self.channels.get(session).map(|c| c.clone())
    }

    pub fn is_processing(&self, session: &SessionId) -> bool {
        self.processing.contains_key(session)
    }

    /// Mark a turn in flight; returns the generation for the deferred clear.
    pub(crate) fn mark_processing(&self, session: &SessionId) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        self.processing.insert(session.clone(), generation);
        generation
    }

    /// Clear the marker only if no newer turn re-marked the session.
    pub(crate) fn clear_processing(&self, session: &SessionId, generation: u64) {
        self.processing
            .remove_if(session, |_, current| *current == generation);
    }

    pub fn enqueue_turn(&self, session: &SessionId, turn: QueuedTurn) {
        self.queues
            .entry(session.clone())
            .or_default()
            .push_back(turn);
    }

    pub fn dequeue_turn(&self, session: &SessionId) -> Option<QueuedTurn> {
        self.queues.get_mut(session).and_then(|mut q| q.pop_front())
    }

    pub fn queue_len(&self, session: &SessionId) -> usize {
        self.queues.get(session).map(|q| q.len()).unwrap_or(0)
    }

    pub fn clear_queue(&self, session: &SessionId) {
        if let Some(mut q) = self.queues.get_mut(session) {
            q.clear();
        }
    }

    pub fn turn_ui(&self, session: &SessionId) -> Option<Arc<TurnUi>> {
        self.turn_ui.get(session).map(|u| u.clone())
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.registry.active_session()
    }

    /// Last seen chat — where watcher/scanner notifications go.
    pub fn notify_chat(&self) -> Option<ChatId> {
        self.registry.chat_id().map(ChatId)
    }
}
