//! Daemon configuration.
//!
//! The on-disk format is a flat `KEY=VALUE` file with `#` comments at
//! `~/.remotecode/config` — fixed by the external contract, so the file is
//! hand-parsed into a map and then merged with environment overrides through
//! figment (env always wins).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Environment keys recognized as overrides for the config file.
const ENV_KEYS: &[&str] = &[
    "telegram_bot_token",
    "remotecode_allowed_users",
    "remotecode_yolo",
    "remotecode_verbose",
    "remotecode_auto_sync",
    "remotecode_agent_bin",
];

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot API token (required).
    pub bot_token: String,
    /// Allowed Telegram users: numeric ids and `@`-prefixed usernames (required).
    pub allowed_users: Vec<String>,
    /// Daemon-wide auto-allow of all tool invocations.
    pub yolo: bool,
    /// Raise the default log filter to debug.
    pub verbose: bool,
    /// Initial state of the auto-sync toggle (the registry value wins later).
    pub auto_sync: bool,
    /// Agent CLI binary. Resolved via PATH unless absolute.
    pub agent_bin: String,
    /// Per-user state directory, `~/.remotecode`.
    pub home: PathBuf,
    /// Root of the Agent's conversation tree, `<agent-home>/projects`.
    pub projects_root: PathBuf,
    /// User-wide Agent settings file consulted for static permission rules.
    pub agent_settings: PathBuf,
}

/// Untyped merge target: config-file map overlaid with env vars.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RawConfig {
    telegram_bot_token: Option<String>,
    remotecode_allowed_users: Option<String>,
    remotecode_yolo: Option<String>,
    remotecode_verbose: Option<String>,
    remotecode_auto_sync: Option<String>,
    remotecode_agent_bin: Option<String>,
}

impl Config {
    /// Load from `<home>/.remotecode/config` with env overrides.
    ///
    /// Missing required keys (`TELEGRAM_BOT_TOKEN`, `REMOTECODE_ALLOWED_USERS`)
    /// are a startup error — the daemon exits 1.
    pub fn load() -> Result<Self> {
        let home = state_dir();
        let raw = Self::raw_from(&home.join("config"))?;
        Self::from_raw(raw, home)
    }

    /// Load against an explicit state directory (tests).
    pub fn load_from(home: &Path) -> Result<Self> {
        let raw = Self::raw_from(&home.join("config"))?;
        Self::from_raw(raw, home.to_path_buf())
    }

    fn raw_from(config_path: &Path) -> Result<RawConfig> {
        let file_map = match std::fs::read_to_string(config_path) {
            Ok(text) => parse_kv(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Figment::from(Serialized::defaults(file_map))
            .merge(Env::raw().only(ENV_KEYS))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))
    }

    fn from_raw(raw: RawConfig, home: PathBuf) -> Result<Self> {
        let bot_token = raw
            .telegram_bot_token
            .filter(|t| !t.trim().is_empty())
            .ok_or(CoreError::MissingKey {
                key: "TELEGRAM_BOT_TOKEN",
            })?;

        let allowed_users = parse_allowed_users(
            raw.remotecode_allowed_users
                .as_deref()
                .unwrap_or_default(),
        );
        if allowed_users.is_empty() {
            return Err(CoreError::MissingKey {
                key: "REMOTECODE_ALLOWED_USERS",
            });
        }

        Ok(Self {
            bot_token,
            allowed_users,
            yolo: raw.remotecode_yolo.as_deref() == Some("true"),
            verbose: is_truthy(raw.remotecode_verbose.as_deref()),
            auto_sync: raw.remotecode_auto_sync.as_deref() == Some("on"),
            agent_bin: raw
                .remotecode_agent_bin
                .unwrap_or_else(|| "claude".to_string()),
            home,
            projects_root: agent_home().join("projects"),
            agent_settings: agent_home().join("settings.json"),
        })
    }

    pub fn registry_path(&self) -> PathBuf {
        self.home.join("local")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.home.join("remotecode.pid")
    }

    pub fn log_path(&self) -> PathBuf {
        self.home.join("remotecode.log")
    }

    pub fn whisper_model_path(&self) -> PathBuf {
        self.home.join("whisper").join("ggml-small.bin")
    }
}

/// `~/.remotecode`.
pub fn state_dir() -> PathBuf {
    home_dir().join(".remotecode")
}

/// The Agent's own state directory: `CLAUDE_CONFIG_DIR` or `~/.claude`.
pub fn agent_home() -> PathBuf {
    std::env::var("CLAUDE_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".claude"))
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Parse `KEY=VALUE` lines; `#` starts a comment, blank lines are skipped,
/// keys are lowercased for the figment merge.
fn parse_kv(text: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            map.insert(key.to_ascii_lowercase(), value.trim().to_string());
        }
    }
    map
}

/// Comma- and whitespace-separated ids / `@usernames`.
fn parse_allowed_users(raw: &str) -> Vec<String> {
    raw.split([',', ' ', '\t'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_truthy(value: Option<&str>) -> bool {
    match value {
        None => false,
        Some(v) => !matches!(v.trim(), "" | "0" | "false" | "off" | "no"),
    }
}
