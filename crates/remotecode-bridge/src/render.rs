//! Text shaping for outgoing chat messages.

use std::time::SystemTime;

use serde_json::Value;

use remotecode_store::{PendingToolUse, SessionFileInfo};

/// Longest input excerpt shown in a tool descriptor line.
const DESCRIPTOR_MAX: usize = 120;

/// One line describing a tool invocation, e.g. `🔧 Bash: git status`.
pub fn tool_descriptor(name: &str, input: &Value) -> String {
    format!("🔧 {name}: {}", input_summary(name, input))
}

pub fn pending_descriptor(pending: &PendingToolUse) -> String {
    tool_descriptor(&pending.name, &pending.input)
}

fn input_summary(name: &str, input: &Value) -> String {
    let summary = match name {
        "Bash" => input.get("command").and_then(Value::as_str).map(str::to_string),
        "Edit" | "Write" | "Read" => input
            .get("file_path")
            .and_then(Value::as_str)
            .map(str::to_string),
        "Grep" | "Glob" => input
            .get("pattern")
            .and_then(Value::as_str)
            .map(str::to_string),
        "WebFetch" => input.get("url").and_then(Value::as_str).map(str::to_string),
        _ => None,
    };
    let summary = summary.unwrap_or_else(|| compact_json(input));
    clip(&summary, DESCRIPTOR_MAX)
}

fn compact_json(input: &Value) -> String {
    match input {
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Clip to `max` chars with an ellipsis, never splitting a char.
pub fn clip(text: &str, max: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= max {
        return flat;
    }
    let mut out: String = flat.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// `3m ago` / `2h ago` / `5d ago` relative age for session listings.
pub fn relative_age(modified: SystemTime) -> String {
    let secs = SystemTime::now()
        .duration_since(modified)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    match secs {
        0..=59 => "just now".to_string(),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

/// One `/sessions` listing line.
pub fn session_line(info: &SessionFileInfo, preview: Option<&str>) -> String {
    format!(
        "• `{}` — {} ({})\n  /switch_to_{}",
        info.id.short(),
        preview.unwrap_or("(no messages)"),
        relative_age(info.modified),
        info.id.short(),
    )
}

/// Command-safe form of an encoded project name: `-work-proj` → `work_proj`.
pub fn command_safe(encoded: &str) -> String {
    encoded
        .trim_start_matches('-')
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect()
}

pub const HELP_TEXT: &str = "RemoteCode — your coding agent, from chat.\n\n\
Send any text to prompt the active session. Images and voice notes work too.\n\n\
/sessions — recent sessions\n\
/projects — projects with session counts\n\
/new — start a fresh session\n\
/history — recent turns of the active session\n\
/model — pick the model\n\
/resume [prefix] — switch to a session by id prefix\n\
/cancel — stop the current turn\n\
/sync — toggle mirroring of host-side activity";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bash_descriptor_shows_the_command() {
        let d = tool_descriptor("Bash", &json!({"command": "git status"}));
        assert_eq!(d, "🔧 Bash: git status");
    }

    #[test]
    fn edit_descriptor_shows_the_path() {
        let d = tool_descriptor("Edit", &json!({"file_path": "/src/main.rs", "old_string": "x"}));
        assert_eq!(d, "🔧 Edit: /src/main.rs");
    }

    #[test]
    fn unknown_tool_falls_back_to_compact_json() {
        let d = tool_descriptor("MyTool", &json!({"a": 1}));
        assert_eq!(d, "🔧 MyTool: {\"a\":1}");
    }

    #[test]
    fn long_command_is_clipped() {
        let command = "x".repeat(500);
        let d = tool_descriptor("Bash", &json!({"command": command}));
        assert!(d.chars().count() < 160);
        assert!(d.ends_with('…'));
    }

    #[test]
    fn newlines_are_flattened_in_descriptors() {
        let d = tool_descriptor("Bash", &json!({"command": "a\nb"}));
        assert_eq!(d, "🔧 Bash: a b");
    }

    #[test]
    fn relative_age_buckets() {
        let now = SystemTime::now();
        assert_eq!(relative_age(now), "just now");
        assert_eq!(
            relative_age(now - std::time::Duration::from_secs(120)),
            "2m ago"
        );
        assert_eq!(
            relative_age(now - std::time::Duration::from_secs(7200)),
            "2h ago"
        );
        assert_eq!(
            relative_age(now - std::time::Duration::from_secs(200_000)),
            "2d ago"
        );
    }

    #[test]
    fn command_safe_names() {
        assert_eq!(command_safe("-home-u-my-app"), "home_u_my_app");
        assert_eq!(command_safe("-srv-App.v2"), "srv_app_v2");
    }
}
