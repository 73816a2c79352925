//! The Agent Channel: one long-lived Agent CLI process per live session.
//!
//! The child is driven over stream-json stdin/stdout. A channel owns the
//! process, a single streaming-input queue, and a turn lock; tool-permission
//! callbacks surface through the [`permission::PermissionHandler`] trait
//! injected at spawn time.

pub mod channel;
pub mod error;
pub mod events;
pub mod permission;
pub mod protocol;

pub use channel::{AgentChannel, ChannelOptions, Turn};
pub use error::{AgentError, Result};
pub use events::{AgentEvent, AssistantBlock};
pub use permission::{PermissionDecision, PermissionHandler, ToolPermissionRequest};
