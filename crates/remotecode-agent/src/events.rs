//! Typed turn events produced by a channel's stream.

use serde_json::Value;

use crate::protocol::{OutputLine, WireBlock};

#[derive(Debug, Clone, PartialEq)]
pub enum AssistantBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// One per turn start.
    SystemInit { session_id: String },
    /// Assistant content; several per turn.
    Assistant { blocks: Vec<AssistantBlock> },
    /// A sub-agent task began.
    TaskStarted { description: String },
    /// A sub-agent task reported progress or finished.
    TaskNotification { status: String, summary: String },
    /// Exactly one terminates the turn.
    Result { is_error: bool, errors: Vec<String> },
}

impl AgentEvent {
    /// Map a parsed output line to a turn event. Control frames and unknown
    /// lines return `None` — they are handled (or dropped) by the reader.
    pub fn from_line(line: OutputLine) -> Option<AgentEvent> {
        match line {
            OutputLine::System {
                subtype,
                session_id,
                description,
                status,
                summary,
            } => match subtype.as_deref() {
                Some("init") => Some(AgentEvent::SystemInit {
                    session_id: session_id.unwrap_or_default(),
                }),
                Some("task_started") => Some(AgentEvent::TaskStarted {
                    description: description.unwrap_or_default(),
                }),
                Some("task_notification") => Some(AgentEvent::TaskNotification {
                    status: status.unwrap_or_default(),
                    summary: summary.unwrap_or_default(),
                }),
                _ => None,
            },
            OutputLine::Assistant { message } => {
                let blocks: Vec<AssistantBlock> = message
                    .content
                    .into_iter()
                    .filter_map(|block| match block {
                        WireBlock::Text { text } => Some(AssistantBlock::Text(text)),
                        WireBlock::ToolUse { id, name, input } => {
                            Some(AssistantBlock::ToolUse { id, name, input })
                        }
                        WireBlock::Unknown => None,
                    })
                    .collect();
                Some(AgentEvent::Assistant { blocks })
            }
            OutputLine::Result {
                is_error, errors, ..
            } => Some(AgentEvent::Result { is_error, errors }),
            OutputLine::ControlRequest { .. }
            | OutputLine::ControlResponse { .. }
            | OutputLine::Unknown => None,
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, AgentEvent::Result { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_line_becomes_system_init() {
        let line = OutputLine::parse(r#"{"type":"system","subtype":"init","session_id":"s"}"#)
            .unwrap();
        assert_eq!(
            AgentEvent::from_line(line),
            Some(AgentEvent::SystemInit {
                session_id: "s".into()
            })
        );
    }

    #[test]
    fn task_lines_become_task_events() {
        let started =
            OutputLine::parse(r#"{"type":"system","subtype":"task_started","description":"explore"}"#)
                .unwrap();
        assert_eq!(
            AgentEvent::from_line(started),
            Some(AgentEvent::TaskStarted {
                description: "explore".into()
            })
        );

        let note = OutputLine::parse(
            r#"{"type":"system","subtype":"task_notification","status":"done","summary":"ok"}"#,
        )
        .unwrap();
        assert_eq!(
            AgentEvent::from_line(note),
            Some(AgentEvent::TaskNotification {
                status: "done".into(),
                summary: "ok".into()
            })
        );
    }

    #[test]
    fn other_system_subtypes_are_dropped() {
        let line = OutputLine::parse(r#"{"type":"system","subtype":"hook_event"}"#).unwrap();
        assert_eq!(AgentEvent::from_line(line), None);
    }

    #[test]
    fn assistant_unknown_blocks_are_filtered() {
        let line = OutputLine::parse(
            r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"x"},{"type":"text","text":"a"}]}}"#,
        )
        .unwrap();
        let Some(AgentEvent::Assistant { blocks }) = AgentEvent::from_line(line) else {
            panic!("expected assistant event");
        };
        assert_eq!(blocks, vec![AssistantBlock::Text("a".into())]);
    }

    #[test]
    fn result_terminates() {
        let line = OutputLine::parse(r#"{"type":"result","is_error":true,"errors":["boom"]}"#)
            .unwrap();
        let event = AgentEvent::from_line(line).unwrap();
        assert!(event.is_result());
        assert_eq!(
            event,
            AgentEvent::Result {
                is_error: true,
                errors: vec!["boom".into()]
            }
        );
    }
}
