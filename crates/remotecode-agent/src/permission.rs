//! Tool-permission callback seam.
//!
//! The channel calls the injected handler for every `can_use_tool` request;
//! the bridge's arbiter implements it. Decisions are written back to the
//! Agent as `control_response` lines.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use remotecode_core::types::SessionId;

#[derive(Debug, Clone)]
pub struct ToolPermissionRequest {
    pub session_id: SessionId,
    /// Correlation id shared with the record file's tool_use block, when the
    /// Agent provides one.
    pub tool_use_id: Option<String>,
    pub tool_name: String,
    pub input: Value,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    Allow {
        updated_input: Option<Value>,
    },
    Deny {
        message: String,
        /// Ask the Agent to stop the whole turn, not just skip the tool.
        interrupt: bool,
    },
}

impl PermissionDecision {
    pub fn allow() -> Self {
        PermissionDecision::Allow {
            updated_input: None,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        PermissionDecision::Deny {
            message: message.into(),
            interrupt: false,
        }
    }
}

#[async_trait]
pub trait PermissionHandler: Send + Sync {
    /// Decide one tool invocation. `cancel` fires when the turn is being torn
    /// down (deny-all, interrupt) — implementations should resolve promptly
    /// as deny once it does.
    async fn on_tool_use(
        &self,
        request: ToolPermissionRequest,
        cancel: CancellationToken,
    ) -> PermissionDecision;
}
