//! Telegram transport adapter.
//!
//! Wraps a teloxide `Bot` behind the core's `ChatApi` trait and drives the
//! long-polling dispatcher, converting Telegram updates into transport-
//! neutral `ChatUpdate`s for the bridge. Long polling — no public URL
//! required.

pub mod allow;
pub mod api;
pub mod dispatcher;
pub mod markdown;

pub use api::TelegramApi;
pub use dispatcher::{preflight, TelegramDispatcher, UpdateSink};
