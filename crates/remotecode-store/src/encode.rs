//! Project-directory name encoding.
//!
//! The Agent derives the per-project directory name from the working
//! directory by replacing `/` and `_` with `-`; the leading `.` of a hidden
//! component becomes `-` too, so `/home/u/.config` reads `-home-u--config`.
//! The mapping is lossy — `a-b` may have been `a/b` or `a_b` — so the decoder
//! consults the filesystem, greedily preferring the `_`-joined interpretation
//! and falling back to `/`.

use std::path::{Path, PathBuf};

/// Encode a working directory into the Agent's project directory name.
pub fn encode_project_dir(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let mut out = String::with_capacity(raw.len());
    let mut component_start = true;
    for ch in raw.chars() {
        match ch {
            '/' => {
                out.push('-');
                component_start = true;
            }
            '_' => {
                out.push('-');
                component_start = false;
            }
            '.' if component_start => {
                out.push('-');
                component_start = false;
            }
            c => {
                out.push(c);
                component_start = false;
            }
        }
    }
    out
}

/// Decode a project directory name back into an absolute path.
///
/// Resolution probes the filesystem: at each boundary the longest
/// `_`-joined component that exists wins, with backtracking to the `/`
/// split. When nothing on disk matches (deleted project), the all-`/`
/// reading is returned so callers still get a displayable path.
pub fn decode_project_dir(encoded: &str) -> PathBuf {
    let segments: Vec<&str> = encoded.split('-').collect();
    if let Some(("", rest)) = segments.split_first().map(|(h, t)| (*h, t)) {
        if let Some(found) = resolve(Path::new("/"), rest) {
            return found;
        }
    }
    naive_decode(encoded)
}

fn resolve(base: &Path, segments: &[&str]) -> Option<PathBuf> {
    if segments.is_empty() {
        return Some(base.to_path_buf());
    }

    // An empty leading segment marks a hidden component: the `-` that
    // produced it stands for the stripped `.`.
    let (hidden, segments) = match segments.split_first() {
        Some((seg, rest)) if seg.is_empty() => (true, rest),
        _ => (false, segments),
    };
    if segments.is_empty() {
        return None;
    }

    for take in (1..=segments.len()).rev() {
        let mut name = segments[..take].join("_");
        if hidden {
            name.insert(0, '.');
        }
        let candidate = base.join(&name);
        if candidate.is_dir() {
            if let Some(found) = resolve(&candidate, &segments[take..]) {
                return Some(found);
            }
        }
    }
    None
}

/// The `/`-only reading: `--` becomes `/.`, every other `-` becomes `/`.
fn naive_decode(encoded: &str) -> PathBuf {
    let mut out = String::with_capacity(encoded.len());
    let mut chars = encoded.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '-' {
            out.push('/');
            if chars.peek() == Some(&'-') {
                chars.next();
                out.push('.');
            }
        } else {
            out.push(ch);
        }
    }
    PathBuf::from(out)
}
