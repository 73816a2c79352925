//! Enumeration of the conversation tree.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use remotecode_core::types::SessionId;

use crate::encode::{decode_project_dir, encode_project_dir};
use crate::record::{parse_lines, SessionRecord};

/// How many recent sessions the prefix lookup consults before falling back
/// to a full filesystem scan.
const RECENT_INDEX: usize = 50;

/// Minimum prefix length allowed to trigger the full scan.
const FULL_SCAN_MIN_PREFIX: usize = 8;

/// One-line preview length for session listings.
const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone)]
pub struct ProjectInfo {
    /// On-disk directory name under `projects/`.
    pub encoded: String,
    /// Decoded working directory.
    pub workdir: PathBuf,
    pub session_count: usize,
    pub last_modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct SessionFileInfo {
    pub id: SessionId,
    pub encoded_project: String,
    pub workdir: PathBuf,
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// Read-only view of `<agent-home>/projects`.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    projects_root: PathBuf,
}

impl ConversationStore {
    pub fn new(projects_root: PathBuf) -> Self {
        Self { projects_root }
    }

    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    /// Path of the record file for `session` under `workdir`'s project.
    pub fn session_file(&self, workdir: &Path, session: &SessionId) -> PathBuf {
        self.projects_root
            .join(encode_project_dir(workdir))
            .join(format!("{session}.jsonl"))
    }

    /// All projects, most recently touched first. Missing tree → empty.
    pub fn list_projects(&self) -> Vec<ProjectInfo> {
        let Ok(entries) = std::fs::read_dir(&self.projects_root) else {
            return Vec::new();
        };
        let mut projects: Vec<ProjectInfo> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| {
                let encoded = e.file_name().to_string_lossy().into_owned();
                let sessions = session_files(&e.path());
                let last_modified = sessions
                    .iter()
                    .map(|(_, m)| *m)
                    .max()
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                ProjectInfo {
                    workdir: decode_project_dir(&encoded),
                    encoded,
                    session_count: sessions.len(),
                    last_modified,
                }
            })
            .collect();
        projects.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        projects
    }

    /// Most recent sessions across every project, mtime descending.
    pub fn recent_sessions(&self, limit: usize) -> Vec<SessionFileInfo> {
        let Ok(entries) = std::fs::read_dir(&self.projects_root) else {
            return Vec::new();
        };
        let mut sessions: Vec<SessionFileInfo> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .flat_map(|project| {
                let encoded = project.file_name().to_string_lossy().into_owned();
                let workdir = decode_project_dir(&encoded);
                session_files(&project.path())
                    .into_iter()
                    .map(move |(path, modified)| SessionFileInfo {
                        id: session_id_of(&path),
                        encoded_project: encoded.clone(),
                        workdir: workdir.clone(),
                        path,
                        modified,
                    })
            })
            .collect();
        sessions.sort_by(|a, b| b.modified.cmp(&a.modified));
        sessions.truncate(limit);
        sessions
    }

    /// Sessions of one project, mtime descending.
    pub fn sessions_in_project(&self, encoded: &str, limit: usize) -> Vec<SessionFileInfo> {
        let dir = self.projects_root.join(encoded);
        let workdir = decode_project_dir(encoded);
        let mut sessions: Vec<SessionFileInfo> = session_files(&dir)
            .into_iter()
            .map(|(path, modified)| SessionFileInfo {
                id: session_id_of(&path),
                encoded_project: encoded.to_string(),
                workdir: workdir.clone(),
                path,
                modified,
            })
            .collect();
        sessions.sort_by(|a, b| b.modified.cmp(&a.modified));
        sessions.truncate(limit);
        sessions
    }

    /// Sessions modified within `window` — the scanner's working set.
    pub fn sessions_modified_within(&self, window: std::time::Duration) -> Vec<SessionFileInfo> {
        let cutoff = SystemTime::now()
            .checked_sub(window)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        self.recent_sessions(usize::MAX)
            .into_iter()
            .filter(|s| s.modified >= cutoff)
            .collect()
    }

    /// Resolve a session by id prefix. The recent-50 index is consulted
    /// first; a prefix of at least 8 chars falls back to scanning the whole
    /// tree so very old sessions stay reachable.
    pub fn find_by_prefix(&self, prefix: &str) -> Option<SessionFileInfo> {
        if prefix.is_empty() {
            return None;
        }
        let recent = self.recent_sessions(RECENT_INDEX);
        if let Some(found) = recent
            .into_iter()
            .find(|s| s.id.as_str().starts_with(prefix))
        {
            return Some(found);
        }
        if prefix.len() < FULL_SCAN_MIN_PREFIX {
            return None;
        }
        self.recent_sessions(usize::MAX)
            .into_iter()
            .find(|s| s.id.as_str().starts_with(prefix))
    }

    /// Parse a whole record file; malformed lines are dropped.
    pub fn read_records(&self, path: &Path) -> Vec<SessionRecord> {
        match std::fs::read_to_string(path) {
            Ok(text) => parse_lines(&text),
            Err(_) => Vec::new(),
        }
    }

    /// First real user text, truncated to a one-line preview.
    pub fn preview(&self, path: &Path) -> Option<String> {
        self.read_records(path)
            .into_iter()
            .find(|r| r.is_real_user_text())
            .map(|r| one_line_preview(&r.text()))
    }
}

fn session_files(dir: &Path) -> Vec<(PathBuf, SystemTime)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"))
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((e.path(), modified))
        })
        .collect()
}

fn session_id_of(path: &Path) -> SessionId {
    SessionId::from_string(
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
    )
}

fn one_line_preview(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or_default().trim();
    if first_line.chars().count() <= PREVIEW_CHARS {
        return first_line.to_string();
    }
    let mut out: String = first_line.chars().take(PREVIEW_CHARS - 1).collect();
    out.push('…');
    out
}
