//! Read-only index of the Agent's on-disk conversation tree.
//!
//! The external Agent persists each session as an append-only JSONL file at
//! `<agent-home>/projects/<encoded-dir>/<session-id>.jsonl`. This crate never
//! writes to that tree; it enumerates projects and sessions, parses the
//! record stream (tolerating malformed lines), and scans file tails for
//! pending tool_use correlation ids.

pub mod encode;
pub mod error;
pub mod index;
pub mod record;
pub mod tail;

pub use error::{Result, StoreError};
pub use index::{ConversationStore, ProjectInfo, SessionFileInfo};
pub use record::{Content, ContentBlock, RecordKind, SessionRecord};
pub use tail::{PendingToolUse, TailReader};
