//! MarkdownV2 escaping.
//!
//! Telegram's MarkdownV2 rejects unescaped specials with a 400; the sender
//! escapes first and falls back to plain text when the parse is still
//! rejected (nested markup from the Agent can defeat any escaper).

/// Escape MarkdownV2 specials outside code spans, preserving backtick fences
/// so Agent output keeps its code formatting.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_code = false;
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '`' {
            in_code = !in_code;
            out.push(ch);
            i += 1;
            continue;
        }
        if in_code {
            out.push(ch);
            i += 1;
            continue;
        }
        match ch {
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '#' | '+' | '-' | '=' | '|' | '{' | '}'
            | '.' | '!' | '>' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_specials() {
        let escaped = escape_markdown_v2("Done. All tests pass!");
        assert_eq!(escaped, "Done\\. All tests pass\\!");
    }

    #[test]
    fn leaves_plain_text_alone() {
        assert_eq!(escape_markdown_v2("hello world 42"), "hello world 42");
    }

    #[test]
    fn code_spans_are_not_escaped() {
        let escaped = escape_markdown_v2("run `cargo test --all` now.");
        assert_eq!(escaped, "run `cargo test --all` now\\.");
    }

    #[test]
    fn dangling_backtick_still_terminates() {
        let escaped = escape_markdown_v2("`unclosed");
        assert_eq!(escaped, "`unclosed");
    }
}
