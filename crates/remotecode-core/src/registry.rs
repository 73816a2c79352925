//! Session registry — the durable record of the active selection.
//!
//! Backed by the flat key/value file `~/.remotecode/local`. Writes are
//! whole-file: read the lines, strip any carrying the target key, append the
//! new line, write everything back. The orchestrator is the only writer, so
//! no cross-process locking is attempted.

use std::path::PathBuf;

use crate::error::Result;
use crate::types::SessionId;

/// The `<agent>` infix in `REMOTECODE_SESSION_<agent>` keys.
const AGENT: &str = "CLAUDE";

pub struct SessionRegistry {
    path: PathBuf,
}

impl SessionRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Read the value for `key`, tolerating an absent file.
    pub fn get(&self, key: &str) -> Option<String> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        let prefix = format!("{key}=");
        text.lines()
            .rev()
            .find_map(|line| line.strip_prefix(&prefix))
            .map(str::to_string)
    }

    /// Set `key` to `value`, rewriting the whole file.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.rewrite(key, Some(value))
    }

    /// Remove `key`, rewriting the whole file.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.rewrite(key, None)
    }

    fn rewrite(&self, key: &str, value: Option<&str>) -> Result<()> {
        let existing = std::fs::read_to_string(&self.path).unwrap_or_default();
        let prefix = format!("{key}=");
        let mut lines: Vec<String> = existing
            .lines()
            .filter(|line| !line.starts_with(&prefix) && !line.trim().is_empty())
            .map(str::to_string)
            .collect();
        if let Some(value) = value {
            lines.push(format!("{key}={value}"));
        }
        let mut out = lines.join("\n");
        out.push('\n');
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, out)?;
        Ok(())
    }

    // --- typed accessors ---------------------------------------------------

    pub fn active_session(&self) -> Option<SessionId> {
        self.get(&format!("REMOTECODE_SESSION_{AGENT}"))
            .filter(|s| !s.is_empty())
            .map(SessionId::from_string)
    }

    pub fn active_workdir(&self) -> Option<PathBuf> {
        self.get(&format!("REMOTECODE_SESSION_{AGENT}_CWD"))
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    }

    pub fn set_active(&self, session: &SessionId, workdir: &std::path::Path) -> Result<()> {
        self.set(&format!("REMOTECODE_SESSION_{AGENT}"), session.as_str())?;
        self.set(
            &format!("REMOTECODE_SESSION_{AGENT}_CWD"),
            &workdir.to_string_lossy(),
        )
    }

    pub fn model(&self) -> Option<String> {
        self.get("REMOTECODE_MODEL").filter(|s| !s.is_empty())
    }

    pub fn set_model(&self, model: &str) -> Result<()> {
        self.set("REMOTECODE_MODEL", model)
    }

    pub fn chat_id(&self) -> Option<i64> {
        self.get("REMOTECODE_CHAT_ID").and_then(|s| s.parse().ok())
    }

    pub fn set_chat_id(&self, chat_id: i64) -> Result<()> {
        self.set("REMOTECODE_CHAT_ID", &chat_id.to_string())
    }

    pub fn auto_sync(&self) -> Option<bool> {
        self.get("REMOTECODE_AUTO_SYNC").map(|v| v == "on")
    }

    pub fn set_auto_sync(&self, on: bool) -> Result<()> {
        self.set("REMOTECODE_AUTO_SYNC", if on { "on" } else { "off" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, SessionRegistry) {
        let dir = TempDir::new().unwrap();
        let reg = SessionRegistry::new(dir.path().join("local"));
        (dir, reg)
    }

    #[test]
    fn absent_file_reads_none() {
        let (_dir, reg) = registry();
        assert!(reg.get("REMOTECODE_MODEL").is_none());
        assert!(reg.active_session().is_none());
    }

    #[test]
    fn set_then_get_round_trips() {
        let (_dir, reg) = registry();
        reg.set("REMOTECODE_MODEL", "opus").unwrap();
        assert_eq!(reg.get("REMOTECODE_MODEL").as_deref(), Some("opus"));
    }

    #[test]
    fn set_replaces_prior_value_without_duplicating_lines() {
        let (_dir, reg) = registry();
        reg.set("REMOTECODE_MODEL", "opus").unwrap();
        reg.set("REMOTECODE_MODEL", "sonnet").unwrap();
        let text = std::fs::read_to_string(reg.path.clone()).unwrap();
        assert_eq!(text.matches("REMOTECODE_MODEL=").count(), 1);
        assert_eq!(reg.get("REMOTECODE_MODEL").as_deref(), Some("sonnet"));
    }

    #[test]
    fn unrelated_keys_survive_a_rewrite() {
        let (_dir, reg) = registry();
        reg.set("REMOTECODE_CHAT_ID", "42").unwrap();
        reg.set("REMOTECODE_MODEL", "opus").unwrap();
        assert_eq!(reg.chat_id(), Some(42));
        assert_eq!(reg.model().as_deref(), Some("opus"));
    }

    #[test]
    fn session_key_does_not_shadow_cwd_key() {
        // REMOTECODE_SESSION_CLAUDE= must not strip REMOTECODE_SESSION_CLAUDE_CWD=.
        let (_dir, reg) = registry();
        let id = SessionId::generate();
        reg.set_active(&id, std::path::Path::new("/work/proj")).unwrap();
        reg.set("REMOTECODE_SESSION_CLAUDE", "other").unwrap();
        assert_eq!(
            reg.active_workdir(),
            Some(PathBuf::from("/work/proj")),
            "CWD key lost on session rewrite"
        );
    }

    #[test]
    fn auto_sync_round_trip() {
        let (_dir, reg) = registry();
        assert_eq!(reg.auto_sync(), None);
        reg.set_auto_sync(true).unwrap();
        assert_eq!(reg.auto_sync(), Some(true));
        reg.set_auto_sync(false).unwrap();
        assert_eq!(reg.auto_sync(), Some(false));
    }

    #[test]
    fn remove_deletes_the_key() {
        let (_dir, reg) = registry();
        reg.set("REMOTECODE_MODEL", "opus").unwrap();
        reg.remove("REMOTECODE_MODEL").unwrap();
        assert!(reg.model().is_none());
    }
}
