use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing required config key: {key}")]
    MissingKey { key: &'static str },

    #[error("Chat transport error: {0}")]
    Transport(String),

    #[error("Chat transport conflict: another poller is active")]
    TransportConflict,

    #[error("Rich-text parse rejected by transport")]
    ParseRejected,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
