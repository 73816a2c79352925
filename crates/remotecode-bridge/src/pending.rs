//! Pending interactive dialogs: permission questions and agent-asked
//! multiple-choice questions.
//!
//! Each dialog is a map entry holding its resolver; resolution comes from a
//! callback-button payload carrying the dialog id, from `deny_all`, or from
//! the 5-minute timeout at the await site.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

use remotecode_core::types::{ChatId, MessageId, SessionId};

/// Default dialog timeout.
pub const DIALOG_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractionKind {
    /// Four-button tool permission dialog.
    Permission { tool_name: String },
    /// AskUserQuestion options dialog. Labels are kept here because the
    /// callback payload only carries the option index.
    Question { options: Vec<String> },
}

/// How a dialog resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Allow,
    /// Allow and add the tool to the session allow-list.
    AllowTool,
    /// Allow and set the session yolo flag.
    Yolo,
    Deny,
    /// Selected AskUserQuestion option label, or free text typed while the
    /// question was open.
    Option(String),
    Skip,
    /// Swept by `/cancel` or a session switch.
    DenyAll,
}

#[derive(Debug)]
struct Entry {
    session: SessionId,
    chat: ChatId,
    /// Attached after the dialog message is actually sent — the button
    /// payloads embed the dialog id, so registration happens first.
    message_id: Option<MessageId>,
    kind: InteractionKind,
    tx: oneshot::Sender<Reply>,
}

/// A dialog drained by `deny_all` — enough to edit its chat message.
#[derive(Debug)]
pub struct SweptDialog {
    pub chat: ChatId,
    pub message_id: Option<MessageId>,
    pub kind: InteractionKind,
}

#[derive(Default)]
pub struct PendingInteractions {
    map: DashMap<String, Entry>,
}

impl PendingInteractions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dialog about to be rendered. Returns the dialog id
    /// (callback payloads embed it) and the receiver the dialog task awaits.
    pub fn register(
        &self,
        session: &SessionId,
        chat: ChatId,
        kind: InteractionKind,
    ) -> (String, oneshot::Receiver<Reply>) {
        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let (tx, rx) = oneshot::channel();
        self.map.insert(
            id.clone(),
            Entry {
                session: session.clone(),
                chat,
                message_id: None,
                kind,
                tx,
            },
        );
        (id, rx)
    }

    /// Record the chat message the dialog was rendered as.
    pub fn attach_message(&self, id: &str, message_id: MessageId) {
        if let Some(mut entry) = self.map.get_mut(id) {
            entry.message_id = Some(message_id);
        }
    }

    /// Resolve by id. Returns the dialog's chat location so the caller can
    /// edit or delete the message; `None` when the id is unknown (already
    /// resolved or timed out).
    pub fn resolve(&self, id: &str, reply: Reply) -> Option<SweptDialog> {
        let (_, entry) = self.map.remove(id)?;
        let swept = SweptDialog {
            chat: entry.chat,
            message_id: entry.message_id,
            kind: entry.kind,
        };
        let _ = entry.tx.send(reply);
        Some(swept)
    }

    /// Drop an entry without sending (timeout path — the receiver already
    /// gave up).
    pub fn discard(&self, id: &str) -> Option<SweptDialog> {
        let (_, entry) = self.map.remove(id)?;
        Some(SweptDialog {
            chat: entry.chat,
            message_id: entry.message_id,
            kind: entry.kind,
        })
    }

    /// Resolve every dialog of `session` as [`Reply::DenyAll`].
    pub fn deny_all(&self, session: &SessionId) -> Vec<SweptDialog> {
        let ids: Vec<String> = self
            .map
            .iter()
            .filter(|e| &e.value().session == session)
            .map(|e| e.key().clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.resolve(&id, Reply::DenyAll))
            .collect()
    }

    /// The open AskUserQuestion dialog for `session`, if any.
    pub fn question_for(&self, session: &SessionId) -> Option<String> {
        self.map
            .iter()
            .find(|e| {
                e.value().session == *session
                    && matches!(e.value().kind, InteractionKind::Question { .. })
            })
            .map(|e| e.key().clone())
    }

    /// Label of option `index` of a question dialog.
    pub fn question_option(&self, id: &str, index: usize) -> Option<String> {
        let entry = self.map.get(id)?;
        match &entry.kind {
            InteractionKind::Question { options } => options.get(index).cloned(),
            InteractionKind::Permission { .. } => None,
        }
    }

    /// Any dialog open for `session`?
    pub fn has_dialog(&self, session: &SessionId) -> bool {
        self.map.iter().any(|e| e.value().session == *session)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionId {
        SessionId::generate()
    }

    #[tokio::test]
    async fn resolve_delivers_reply_and_location() {
        let pending = PendingInteractions::new();
        let sid = session();
        let (id, rx) = pending.register(
            &sid,
            ChatId(7),
            InteractionKind::Permission {
                tool_name: "Bash".into(),
            },
        );
        pending.attach_message(&id, MessageId(42));
        let swept = pending.resolve(&id, Reply::Allow).unwrap();
        assert_eq!(swept.chat, ChatId(7));
        assert_eq!(swept.message_id, Some(MessageId(42)));
        assert_eq!(rx.await.unwrap(), Reply::Allow);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn unknown_id_resolves_to_none() {
        let pending = PendingInteractions::new();
        assert!(pending.resolve("nope", Reply::Deny).is_none());
    }

    #[tokio::test]
    async fn deny_all_sweeps_only_the_target_session() {
        let pending = PendingInteractions::new();
        let a = session();
        let b = session();
        let (_, rx_a) = pending.register(
            &a,
            ChatId(1),
            InteractionKind::Permission {
                tool_name: "Bash".into(),
            },
        );
        let (id_b, _rx_b) = pending.register(
            &b,
            ChatId(1),
            InteractionKind::Permission {
                tool_name: "Edit".into(),
            },
        );

        let swept = pending.deny_all(&a);
        assert_eq!(swept.len(), 1);
        assert_eq!(rx_a.await.unwrap(), Reply::DenyAll);
        assert!(pending.resolve(&id_b, Reply::Allow).is_some());
    }

    #[tokio::test]
    async fn question_lookup_ignores_permission_dialogs() {
        let pending = PendingInteractions::new();
        let sid = session();
        pending.register(
            &sid,
            ChatId(1),
            InteractionKind::Permission {
                tool_name: "Bash".into(),
            },
        );
        assert!(pending.question_for(&sid).is_none());
        let (qid, _rx) = pending.register(
            &sid,
            ChatId(1),
            InteractionKind::Question {
                options: vec!["A".into(), "B".into()],
            },
        );
        assert_eq!(pending.question_for(&sid).as_deref(), Some(qid.as_str()));
        assert_eq!(pending.question_option(&qid, 1).as_deref(), Some("B"));
        assert!(pending.question_option(&qid, 5).is_none());
    }

    #[tokio::test]
    async fn dropped_receiver_does_not_break_resolution() {
        let pending = PendingInteractions::new();
        let sid = session();
        let (id, rx) = pending.register(
            &sid,
            ChatId(1),
            InteractionKind::Question { options: vec![] },
        );
        drop(rx);
        assert!(pending.resolve(&id, Reply::Skip).is_some());
    }
}
