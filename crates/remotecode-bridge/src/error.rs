use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("No working directory for this session — use /projects to pick one")]
    MissingWorkdir,

    #[error("Working directory does not exist: {0}")]
    WorkdirGone(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Voice input is not available: {0}")]
    VoiceUnavailable(String),

    #[error(transparent)]
    Core(#[from] remotecode_core::CoreError),

    #[error(transparent)]
    Agent(#[from] remotecode_agent::AgentError),

    #[error(transparent)]
    Store(#[from] remotecode_store::StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
