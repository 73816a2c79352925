//! Wire format of the Agent CLI's stream-json mode.
//!
//! One JSON object per line in both directions. Output lines carry the turn
//! events plus `control_request` frames for tool permissions; input lines are
//! user messages and `control_response` frames.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::permission::PermissionDecision;

#[derive(Debug, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub content: Vec<WireBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequest {
    CanUseTool {
        tool_name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// One line of Agent stdout.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputLine {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        summary: Option<String>,
    },
    Assistant {
        message: WireMessage,
    },
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        errors: Vec<String>,
        #[serde(default)]
        result: Option<String>,
    },
    ControlRequest {
        request_id: String,
        request: ControlRequest,
    },
    ControlResponse {
        #[serde(default)]
        response: Value,
    },
    #[serde(other)]
    Unknown,
}

impl OutputLine {
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }
}

/// Serialize one user message for the input queue.
pub fn user_message_line(text: &str) -> Serialized {
    Serialized(json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{ "type": "text", "text": text }],
        },
    }))
}

/// Serialize the reply to a `can_use_tool` control request.
pub fn control_response_line(request_id: &str, decision: &PermissionDecision) -> Serialized {
    let response = match decision {
        PermissionDecision::Allow { updated_input } => {
            let mut body = json!({ "behavior": "allow" });
            if let Some(input) = updated_input {
                body["updatedInput"] = input.clone();
            }
            body
        }
        PermissionDecision::Deny { message, interrupt } => json!({
            "behavior": "deny",
            "message": message,
            "interrupt": interrupt,
        }),
    };
    Serialized(json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": response,
        },
    }))
}

/// Serialize an interrupt request for the current turn.
pub fn interrupt_request_line(request_id: &str) -> Serialized {
    Serialized(json!({
        "type": "control_request",
        "request_id": request_id,
        "request": { "subtype": "interrupt" },
    }))
}

/// A ready-to-write stdin line (newline not included).
pub struct Serialized(Value);

impl Serialized {
    pub fn into_line(self) -> String {
        self.0.to_string()
    }
}
