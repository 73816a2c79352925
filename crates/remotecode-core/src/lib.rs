//! Shared foundations for the RemoteCode bridge: configuration, the session
//! registry, log rotation, transport-neutral chat types, and error kinds.

pub mod chat;
pub mod config;
pub mod error;
pub mod logging;
pub mod registry;
pub mod types;

pub use error::{CoreError, Result};
