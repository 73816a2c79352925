//! Tail access to a session record file.
//!
//! Two consumers: the permission scanners read the last ~64 KiB and compute
//! the set of pending tool_use correlation ids; the watcher reads forward
//! from a remembered byte offset, parsing only complete lines.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use serde_json::Value;

use crate::error::Result;
use crate::record::{parse_lines, SessionRecord};

/// How far back the pending-permission scan looks.
pub const TAIL_BYTES: u64 = 64 * 1024;

/// A tool_use that has not yet been answered by a tool_result.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Read the last [`TAIL_BYTES`] of `path`. Returns the text and the current
/// file size. When the read starts mid-file the first (partial) line is
/// dropped.
pub fn read_tail(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(TAIL_BYTES);
    file.seek(SeekFrom::Start(start))?;
    let mut text = String::new();
    file.read_to_string(&mut text)?;
    if start > 0 {
        if let Some(pos) = text.find('\n') {
            text.drain(..=pos);
        } else {
            text.clear();
        }
    }
    Ok((text, len))
}

/// Pending tool_uses in the file tail: ids introduced by assistant entries
/// and not cleared by a later user tool_result. Order of first appearance is
/// kept so "the first pending tool" is deterministic.
pub fn pending_tool_uses(path: &Path) -> Vec<PendingToolUse> {
    let Ok((text, _)) = read_tail(path) else {
        return Vec::new();
    };
    pending_in_records(&parse_lines(&text))
}

pub fn pending_in_records(records: &[SessionRecord]) -> Vec<PendingToolUse> {
    // BTreeMap keyed by arrival index keeps first-seen order after removals.
    let mut pending: BTreeMap<usize, PendingToolUse> = BTreeMap::new();
    let mut seq = 0usize;
    for record in records {
        for (id, name, input) in record.tool_uses() {
            pending.insert(
                seq,
                PendingToolUse {
                    id: id.to_string(),
                    name: name.to_string(),
                    input: input.clone(),
                },
            );
            seq += 1;
        }
        for cleared in record.tool_result_ids() {
            pending.retain(|_, p| p.id != cleared);
        }
    }
    pending.into_values().collect()
}

/// Last real user text input in the tail — what a takeover resubmits.
pub fn last_user_text(path: &Path) -> Option<String> {
    let (text, _) = read_tail(path).ok()?;
    parse_lines(&text)
        .into_iter()
        .rev()
        .find(|r| r.is_real_user_text())
        .map(|r| r.text())
}

/// Incremental forward reader used by the watcher. Tracks a byte offset and
/// yields only records from complete lines appended since the last call.
#[derive(Debug)]
pub struct TailReader {
    offset: u64,
}

impl TailReader {
    pub fn new(offset: u64) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Jump the offset to the current end of `path`.
    pub fn skip_to_end(&mut self, path: &Path) {
        self.offset = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    }

    /// Read everything appended since the stored offset. A trailing partial
    /// line stays unconsumed for the next call.
    pub fn read_new(&mut self, path: &Path) -> Result<Vec<SessionRecord>> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < self.offset {
            // Truncated or replaced — start over.
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        file.read_to_end(&mut buf)?;

        let complete = match buf.iter().rposition(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None => return Ok(Vec::new()),
        };
        self.offset += complete as u64;
        let text = String::from_utf8_lossy(&buf[..complete]);
        Ok(parse_lines(&text))
    }
}
