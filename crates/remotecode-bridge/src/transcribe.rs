//! Voice-note transcription seam.
//!
//! The dispatcher downloads the voice file and hands the path here. The
//! shipped implementation shells out to a whisper.cpp CLI with the model at
//! `~/.remotecode/whisper/ggml-small.bin`; a missing model or binary turns
//! into a user-visible rejection.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{BridgeError, Result};

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &Path) -> Result<String>;
}

pub struct WhisperCli {
    binary: String,
    model: PathBuf,
}

impl WhisperCli {
    pub fn new(model: PathBuf) -> Self {
        Self {
            binary: "whisper-cli".to_string(),
            model,
        }
    }
}

#[async_trait]
impl Transcriber for WhisperCli {
    async fn transcribe(&self, audio: &Path) -> Result<String> {
        if !self.model.exists() {
            return Err(BridgeError::VoiceUnavailable(format!(
                "speech model not installed at {}",
                self.model.display()
            )));
        }
        let output = tokio::process::Command::new(&self.binary)
            .arg("-m")
            .arg(&self.model)
            .arg("-f")
            .arg(audio)
            .args(["-nt", "-np"])
            .output()
            .await
            .map_err(|e| {
                BridgeError::VoiceUnavailable(format!("whisper-cli not available: {e}"))
            })?;
        if !output.status.success() {
            debug!(status = %output.status, "whisper-cli failed");
            return Err(BridgeError::VoiceUnavailable(
                "transcription failed".to_string(),
            ));
        }
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            return Err(BridgeError::VoiceUnavailable(
                "no speech recognized".to_string(),
            ));
        }
        Ok(text)
    }
}
