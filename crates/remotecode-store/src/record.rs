//! The conversation record stream.
//!
//! One JSON object per line. Entries the core cares about carry
//! `type ∈ {user, assistant, system}` and a `message` whose content is either
//! a plain string or a list of typed blocks. Everything else is preserved
//! loosely — the file format belongs to the external Agent and grows fields
//! without notice.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    User,
    Assistant,
    System,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult { tool_use_id: String },
    #[serde(rename = "image")]
    Image,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<Content>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionRecord {
    #[serde(rename = "type")]
    pub kind: RecordKind,
    #[serde(default)]
    pub message: Option<RecordMessage>,
    #[serde(default, rename = "isMeta")]
    pub is_meta: bool,
    #[serde(default, rename = "toolUseResult")]
    pub tool_use_result: Option<Value>,
    #[serde(default)]
    pub slug: Option<String>,
}

impl SessionRecord {
    /// Concatenated text content, in block order.
    pub fn text(&self) -> String {
        let Some(message) = &self.message else {
            return String::new();
        };
        match &message.content {
            Some(Content::Text(s)) => s.clone(),
            Some(Content::Blocks(blocks)) => {
                let parts: Vec<&str> = blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                parts.join("\n")
            }
            None => String::new(),
        }
    }

    /// tool_use blocks: (correlation id, tool name, input).
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }

    /// Correlation ids cleared by tool_result blocks in this entry.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }

    fn blocks(&self) -> &[ContentBlock] {
        match self.message.as_ref().and_then(|m| m.content.as_ref()) {
            Some(Content::Blocks(blocks)) => blocks,
            _ => &[],
        }
    }

    /// A "real" user text entry: typed by a human, not meta, not a
    /// tool_result carrier, not the Agent's own command echo.
    pub fn is_real_user_text(&self) -> bool {
        if self.kind != RecordKind::User || self.is_meta || self.tool_use_result.is_some() {
            return false;
        }
        if !self.tool_result_ids().is_empty() {
            return false;
        }
        let text = self.text();
        !text.is_empty() && !text.starts_with('<')
    }

    /// An assistant entry with visible text (tool_use-only entries excluded).
    pub fn is_assistant_text(&self) -> bool {
        self.kind == RecordKind::Assistant
            && self.tool_uses().is_empty()
            && !self.text().is_empty()
    }
}

/// Parse a chunk of JSONL. Malformed lines are skipped with a debug log;
/// order of the surviving records is preserved.
pub fn parse_lines(text: &str) -> Vec<SessionRecord> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<SessionRecord>(line) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(error = %e, "skipping malformed record line");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_text_line(text: &str) -> String {
        format!(
            r#"{{"type":"user","message":{{"role":"user","content":"{text}"}}}}"#
        )
    }

    #[test]
    fn parses_string_content() {
        let records = parse_lines(&user_text_line("hello"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text(), "hello");
        assert!(records[0].is_real_user_text());
    }

    #[test]
    fn parses_block_content_and_tool_uses() {
        let line = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"running"},{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}"#;
        let records = parse_lines(line);
        assert_eq!(records[0].text(), "running");
        let uses = records[0].tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].0, "t1");
        assert_eq!(uses[0].1, "Bash");
    }

    #[test]
    fn tool_result_ids_extracted() {
        let line = r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"}]}}"#;
        let records = parse_lines(line);
        assert_eq!(records[0].tool_result_ids(), vec!["t1"]);
        assert!(!records[0].is_real_user_text());
    }

    #[test]
    fn malformed_lines_are_skipped_preserving_order() {
        let text = format!(
            "{}\nnot json at all\n{{\"broken\": \n{}\n",
            user_text_line("first"),
            user_text_line("second")
        );
        let records = parse_lines(&text);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].text(), "first");
        assert_eq!(records[1].text(), "second");
    }

    #[test]
    fn meta_and_command_echo_entries_are_not_real_user_text() {
        let meta = r#"{"type":"user","isMeta":true,"message":{"role":"user","content":"x"}}"#;
        let echo = r#"{"type":"user","message":{"role":"user","content":"<command-name>/clear</command-name>"}}"#;
        let records = parse_lines(&format!("{meta}\n{echo}"));
        assert!(records.iter().all(|r| !r.is_real_user_text()));
    }

    #[test]
    fn unknown_record_kind_still_parses() {
        let line = r#"{"type":"summary","summary":"something"}"#;
        let records = parse_lines(line);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, RecordKind::Other);
    }

    #[test]
    fn unknown_block_type_is_tolerated() {
        let line = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"done"}]}}"#;
        let records = parse_lines(line);
        assert_eq!(records[0].text(), "done");
    }

    #[test]
    fn assistant_text_detection_excludes_tool_use_entries() {
        let with_tool = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"t"},{"type":"tool_use","id":"a","name":"Bash","input":{}}]}}"#;
        let plain = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"answer"}]}}"#;
        let records = parse_lines(&format!("{with_tool}\n{plain}"));
        assert!(!records[0].is_assistant_text());
        assert!(records[1].is_assistant_text());
    }
}
