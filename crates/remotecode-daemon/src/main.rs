//! The remotecode daemon: wires the Telegram transport, the bridge, the
//! watcher, and the scanner, and supervises shutdown.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use teloxide::Bot;
use tracing::{error, info};

use remotecode_bridge::transcribe::WhisperCli;
use remotecode_bridge::{commands, scanner, watcher, Bridge};
use remotecode_core::chat::ChatUpdate;
use remotecode_core::config::Config;
use remotecode_telegram::{preflight, TelegramApi, TelegramDispatcher, UpdateSink};

#[derive(Parser)]
#[command(name = "remotecode", about = "Chat bridge to a local AI coding agent")]
struct Args {
    /// Log to stderr instead of the rotating log file.
    #[arg(long)]
    foreground: bool,
}

struct BridgeSink {
    bridge: Arc<Bridge>,
}

#[async_trait::async_trait]
impl UpdateSink for BridgeSink {
    async fn handle(&self, update: ChatUpdate) {
        // One task per update: a slow turn must not stall the poll loop.
        let bridge = Arc::clone(&self.bridge);
        tokio::spawn(async move {
            commands::handle_update(bridge, update).await;
        });
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("remotecode: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Running every tool invocation unprompted as root is how hosts die.
    if config.yolo && unsafe { libc::geteuid() } == 0 {
        eprintln!("remotecode: refusing to run with REMOTECODE_YOLO=true as root");
        return ExitCode::FAILURE;
    }

    if let Err(e) =
        remotecode_core::logging::init(config.log_path(), config.verbose, args.foreground)
    {
        eprintln!("remotecode: log setup failed: {e}");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            eprintln!("remotecode: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let bot = Bot::new(&config.bot_token);

    // Another poller on the same token means another daemon is running.
    if let Err(e) = preflight(&bot).await {
        notify_conflict(&bot, &config).await;
        return Err(e.into());
    }

    let pid_path = config.pid_path();
    std::fs::create_dir_all(&config.home)?;
    std::fs::write(&pid_path, std::process::id().to_string())?;

    let transcriber: Arc<dyn remotecode_bridge::transcribe::Transcriber> =
        Arc::new(WhisperCli::new(config.whisper_model_path()));
    let api = Arc::new(TelegramApi::new(bot.clone()));
    let allowed = config.allowed_users.clone();
    let bridge = Bridge::new(config, api, Some(transcriber));

    if let Err(e) = bridge.chat.set_commands(&commands::command_menu()).await {
        // Cosmetic — the bot works without a command menu.
        tracing::debug!(error = %e, "setMyCommands failed");
    }

    tokio::spawn(watcher::run(
        Arc::clone(&bridge),
        bridge.shutdown.child_token(),
    ));
    tokio::spawn(scanner::run(
        Arc::clone(&bridge),
        bridge.shutdown.child_token(),
    ));

    let sink = Arc::new(BridgeSink {
        bridge: Arc::clone(&bridge),
    });
    let dispatcher = TelegramDispatcher::new(bot, allowed);
    tokio::spawn(dispatcher.run(sink));

    info!(pid = std::process::id(), "remotecode daemon running");
    wait_for_shutdown().await;

    info!("shutting down");
    bridge.shutdown.cancel();
    let _ = std::fs::remove_file(&pid_path);
    Ok(())
}

/// Best effort: tell the last-seen chat why the daemon is refusing to start.
async fn notify_conflict(bot: &Bot, config: &Config) {
    use teloxide::prelude::*;
    let registry =
        remotecode_core::registry::SessionRegistry::new(config.registry_path());
    if let Some(chat_id) = registry.chat_id() {
        let _ = bot
            .send_message(
                teloxide::types::ChatId(chat_id),
                "⚠️ Another remotecode instance is already polling this bot — exiting.",
            )
            .await;
    }
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
