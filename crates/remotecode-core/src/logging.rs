//! Log setup: tracing-subscriber writing to a size-rotating file.
//!
//! Rotation is size-based (5 MiB) with a single `.old` generation, which the
//! stock appenders do not offer, so the writer is implemented here as a
//! `MakeWriter`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::error::Result;

/// Rotate once the log file exceeds this many bytes.
pub const LOG_MAX_BYTES: u64 = 5 * 1024 * 1024;

struct Inner {
    path: PathBuf,
    old_path: PathBuf,
    max_bytes: u64,
    file: Mutex<(File, u64)>,
}

/// Size-rotating log file writer: `remotecode.log` + `remotecode.log.old`.
#[derive(Clone)]
pub struct RotatingWriter {
    inner: Arc<Inner>,
}

impl RotatingWriter {
    pub fn new(path: PathBuf) -> Result<Self> {
        Self::with_max_bytes(path, LOG_MAX_BYTES)
    }

    pub fn with_max_bytes(path: PathBuf, max_bytes: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        let old_path = PathBuf::from(format!("{}.old", path.display()));
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                old_path,
                max_bytes,
                file: Mutex::new((file, len)),
            }),
        })
    }
}

pub struct RotatingHandle {
    inner: Arc<Inner>,
}

impl Write for RotatingHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.inner.file.lock().unwrap();
        if guard.1 + buf.len() as u64 > self.inner.max_bytes {
            guard.0.flush()?;
            // Rename the full log aside and start a fresh one. The previous
            // `.old` generation is overwritten.
            std::fs::rename(&self.inner.path, &self.inner.old_path)?;
            guard.0 = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.inner.path)?;
            guard.1 = 0;
        }
        let written = guard.0.write(buf)?;
        guard.1 += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.file.lock().unwrap().0.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingHandle;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `verbose` picks debug over info.
/// With `to_stderr` (foreground runs) the file writer is skipped entirely.
pub fn init(log_path: PathBuf, verbose: bool, to_stderr: bool) -> Result<()> {
    let default_filter = if verbose {
        "remotecode=debug,info"
    } else {
        "remotecode=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    if to_stderr {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        let writer = RotatingWriter::new(log_path)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(writer)
            .init();
    }
    Ok(())
}
