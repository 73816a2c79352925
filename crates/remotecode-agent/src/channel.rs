//! The per-session channel owning one Agent process.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use remotecode_core::types::SessionId;

use crate::error::{AgentError, Result};
use crate::events::AgentEvent;
use crate::permission::{PermissionHandler, ToolPermissionRequest};
use crate::protocol::{
    control_response_line, interrupt_request_line, user_message_line, ControlRequest, OutputLine,
};

/// How long `close` waits for the Agent to exit after stdin closes before
/// killing it.
const CLOSE_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Agent CLI binary, resolved via PATH unless absolute.
    pub agent_bin: String,
    pub model: Option<String>,
    pub workdir: PathBuf,
    /// The session's on-disk record file; watched for third-party growth.
    pub record_file: PathBuf,
    /// Skip `--resume` even when the record file exists — the recovery path
    /// after a corrupted-record resume failure.
    pub force_fresh: bool,
}

enum StdinCommand {
    Line(String),
    Shutdown,
}

struct TurnSlot {
    events_rx: mpsc::UnboundedReceiver<AgentEvent>,
}

/// A live Agent process bound to one session.
///
/// Exactly one turn streams at a time: `begin_turn` holds the turn lock for
/// the lifetime of the returned [`Turn`]. Two concurrent readers are a
/// programming error the lock makes impossible.
pub struct AgentChannel {
    session_id: SessionId,
    /// Mutable: a resumed Agent re-keys the conversation under a new id, and
    /// the channel must track the new record file from then on.
    record_file: std::sync::Mutex<PathBuf>,
    stdin_tx: mpsc::UnboundedSender<StdinCommand>,
    turn: Mutex<TurnSlot>,
    child: Mutex<Option<Child>>,
    stale: AtomicBool,
    interrupted: AtomicBool,
    /// Record file size as of the last completed own turn. Zero means "never
    /// measured" and disables the mismatch check.
    last_self_size: AtomicU64,
    cancel_slot: std::sync::Mutex<CancellationToken>,
    request_seq: AtomicU64,
}

impl AgentChannel {
    /// Spawn the Agent for `session_id`, resuming from the record file when
    /// one exists. The first user message is NOT sent here — callers push it
    /// through [`AgentChannel::begin_turn`].
    pub fn spawn(
        session_id: SessionId,
        options: ChannelOptions,
        handler: Arc<dyn PermissionHandler>,
    ) -> Result<Arc<Self>> {
        let resume = !options.force_fresh
            && std::fs::metadata(&options.record_file)
                .map(|m| m.len() > 0)
                .unwrap_or(false);

        let mut cmd = Command::new(&options.agent_bin);
        cmd.arg("-p")
            .arg("--verbose")
            .args(["--input-format", "stream-json"])
            .args(["--output-format", "stream-json"]);
        if let Some(model) = &options.model {
            cmd.args(["--model", model]);
        }
        if resume {
            cmd.args(["--resume", session_id.as_str()]);
        } else {
            cmd.args(["--session-id", session_id.as_str()]);
        }
        cmd.current_dir(&options.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(AgentError::Spawn)?;
        info!(session = %session_id, resume, "agent process spawned");

        let stdin = child.stdin.take().ok_or(AgentError::InputClosed)?;
        let stdout = child.stdout.take().ok_or(AgentError::InputClosed)?;
        let stderr = child.stderr.take();

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let initial_size = std::fs::metadata(&options.record_file)
            .map(|m| m.len())
            .unwrap_or(0);

        let channel = Arc::new(Self {
            session_id: session_id.clone(),
            record_file: std::sync::Mutex::new(options.record_file.clone()),
            stdin_tx: stdin_tx.clone(),
            turn: Mutex::new(TurnSlot { events_rx }),
            child: Mutex::new(Some(child)),
            stale: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            last_self_size: AtomicU64::new(initial_size),
            cancel_slot: std::sync::Mutex::new(CancellationToken::new()),
            request_seq: AtomicU64::new(0),
        });

        tokio::spawn(run_stdin_writer(stdin, stdin_rx));
        if let Some(stderr) = stderr {
            let session = session_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(session = %session, "agent stderr: {line}");
                }
            });
        }
        tokio::spawn(run_stdout_reader(
            Arc::clone(&channel),
            stdout,
            events_tx,
            handler,
        ));

        Ok(channel)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Acquire the turn lock and push `prompt` into the input queue. The
    /// returned [`Turn`] yields events until `Result` (or `None` when the
    /// process died).
    pub async fn begin_turn(&self, prompt: &str) -> Result<Turn<'_>> {
        let slot = self.turn.lock().await;
        self.interrupted.store(false, Ordering::SeqCst);
        *self.cancel_slot.lock().unwrap() = CancellationToken::new();
        self.push_line(user_message_line(prompt).into_line())?;
        Ok(Turn { slot })
    }

    /// `true` while some turn holds the lock.
    pub fn is_busy(&self) -> bool {
        self.turn.try_lock().is_err()
    }

    /// Stop the current turn: flag it, cancel outstanding permission waits,
    /// and ask the Agent to interrupt. The turn still terminates through its
    /// `Result` event.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.cancel_slot.lock().unwrap().cancel();
        let seq = self.request_seq.fetch_add(1, Ordering::SeqCst);
        let line = interrupt_request_line(&format!("req_{seq}")).into_line();
        if self.stdin_tx.send(StdinCommand::Line(line)).is_err() {
            debug!(session = %self.session_id, "interrupt after input queue closed");
        }
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Third-party writes detected — force the next reuse to recreate.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    /// Stale when flagged, or when the record file size moved since the last
    /// self-write (both sizes non-zero).
    pub fn is_stale(&self) -> bool {
        if self.stale.load(Ordering::SeqCst) {
            return true;
        }
        let current = std::fs::metadata(&*self.record_file.lock().unwrap())
            .map(|m| m.len())
            .unwrap_or(0);
        size_changed(self.last_self_size.load(Ordering::SeqCst), current)
    }

    /// Capture the record file size after a completed own turn.
    pub fn record_self_size(&self) {
        let current = std::fs::metadata(&*self.record_file.lock().unwrap())
            .map(|m| m.len())
            .unwrap_or(0);
        self.last_self_size.store(current, Ordering::SeqCst);
    }

    /// Re-point at a new record file (the Agent re-keyed the session on
    /// resume) and re-baseline the self-size.
    pub fn set_record_file(&self, path: PathBuf) {
        *self.record_file.lock().unwrap() = path;
        self.record_self_size();
    }

    pub fn last_self_size(&self) -> u64 {
        self.last_self_size.load(Ordering::SeqCst)
    }

    /// End the input queue and wait for the Agent to exit.
    pub async fn close(&self) {
        self.cancel_slot.lock().unwrap().cancel();
        let _ = self.stdin_tx.send(StdinCommand::Shutdown);
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            match tokio::time::timeout(CLOSE_WAIT, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(session = %self.session_id, %status, "agent process exited")
                }
                Ok(Err(e)) => warn!(session = %self.session_id, error = %e, "agent wait failed"),
                Err(_) => {
                    warn!(session = %self.session_id, "agent did not exit in time, killing");
                    let _ = child.kill().await;
                }
            }
        }
    }

    fn push_line(&self, line: String) -> Result<()> {
        self.stdin_tx
            .send(StdinCommand::Line(line))
            .map_err(|_| AgentError::InputClosed)
    }

    fn current_cancel(&self) -> CancellationToken {
        self.cancel_slot.lock().unwrap().clone()
    }
}

/// One streaming turn; dropping it releases the turn lock.
pub struct Turn<'a> {
    slot: MutexGuard<'a, TurnSlot>,
}

impl Turn<'_> {
    /// Next event, or `None` when the Agent process is gone.
    pub async fn next(&mut self) -> Option<AgentEvent> {
        self.slot.events_rx.recv().await
    }
}

/// `true` when both sizes are known and differ.
fn size_changed(last: u64, current: u64) -> bool {
    last != 0 && current != 0 && last != current
}

async fn run_stdin_writer(
    mut stdin: tokio::process::ChildStdin,
    mut rx: mpsc::UnboundedReceiver<StdinCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            StdinCommand::Line(line) => {
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    break;
                }
            }
            StdinCommand::Shutdown => break,
        }
    }
    // Dropping stdin signals EOF — the Agent drains and exits.
}

async fn run_stdout_reader(
    channel: Arc<AgentChannel>,
    stdout: tokio::process::ChildStdout,
    events_tx: mpsc::UnboundedSender<AgentEvent>,
    handler: Arc<dyn PermissionHandler>,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Some(parsed) = OutputLine::parse(&line) else {
            debug!(session = %channel.session_id, "unparseable agent line");
            continue;
        };
        match parsed {
            OutputLine::ControlRequest {
                request_id,
                request:
                    ControlRequest::CanUseTool {
                        tool_name,
                        input,
                        tool_use_id,
                        reason,
                    },
            } => {
                let request = ToolPermissionRequest {
                    session_id: channel.session_id.clone(),
                    tool_use_id,
                    tool_name,
                    input,
                    reason,
                };
                let handler = Arc::clone(&handler);
                let stdin_tx = channel.stdin_tx.clone();
                let cancel = channel.current_cancel();
                // The decision may take minutes (interactive dialog); never
                // block the reader on it.
                tokio::spawn(async move {
                    let decision = handler.on_tool_use(request, cancel).await;
                    let line = control_response_line(&request_id, &decision).into_line();
                    let _ = stdin_tx.send(StdinCommand::Line(line));
                });
            }
            OutputLine::ControlRequest { request_id, .. } => {
                debug!(session = %channel.session_id, request_id, "unhandled control request");
            }
            OutputLine::ControlResponse { .. } => {}
            other => {
                if let Some(event) = AgentEvent::from_line(other) {
                    if events_tx.send(event).is_err() {
                        break;
                    }
                }
            }
        }
    }
    debug!(session = %channel.session_id, "agent stdout closed");
    // events_tx drops here; a pending Turn::next() resolves to None.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::PermissionDecision;
    use async_trait::async_trait;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const ECHO_AGENT: &str = r#"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    *control_response*) ;;
    *control_request*) ;;
    *)
      echo '{"type":"system","subtype":"init","session_id":"fake"}'
      echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}}'
      echo '{"type":"result","is_error":false}'
      ;;
  esac
done
"#;

    const PERMISSION_AGENT: &str = r#"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    *control_response*)
      echo '{"type":"result","is_error":false}'
      ;;
    *control_request*) ;;
    *)
      echo '{"type":"control_request","request_id":"r1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"ls"},"tool_use_id":"t1"}}'
      ;;
  esac
done
"#;

    struct Recorder {
        requests: std::sync::Mutex<Vec<ToolPermissionRequest>>,
    }

    #[async_trait]
    impl PermissionHandler for Recorder {
        async fn on_tool_use(
            &self,
            request: ToolPermissionRequest,
            _cancel: CancellationToken,
        ) -> PermissionDecision {
            self.requests.lock().unwrap().push(request);
            PermissionDecision::allow()
        }
    }

    fn fake_agent(dir: &TempDir, script: &str) -> ChannelOptions {
        let bin = dir.path().join("fake-agent");
        std::fs::write(&bin, script).unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        ChannelOptions {
            agent_bin: bin.to_string_lossy().into_owned(),
            model: None,
            workdir: dir.path().to_path_buf(),
            record_file: dir.path().join("session.jsonl"),
            force_fresh: false,
        }
    }

    async fn collect_turn(turn: &mut Turn<'_>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        loop {
            let next = tokio::time::timeout(Duration::from_secs(5), turn.next())
                .await
                .expect("turn timed out");
            match next {
                Some(event) => {
                    let done = event.is_result();
                    events.push(event);
                    if done {
                        break;
                    }
                }
                None => break,
            }
        }
        events
    }

    #[tokio::test]
    async fn turn_streams_init_text_result() {
        let dir = TempDir::new().unwrap();
        let handler = Arc::new(Recorder {
            requests: std::sync::Mutex::new(Vec::new()),
        });
        let channel =
            AgentChannel::spawn(SessionId::generate(), fake_agent(&dir, ECHO_AGENT), handler)
                .unwrap();

        let mut turn = channel.begin_turn("hi").await.unwrap();
        let events = collect_turn(&mut turn).await;
        drop(turn);

        assert!(matches!(events[0], AgentEvent::SystemInit { .. }));
        assert!(matches!(events[1], AgentEvent::Assistant { .. }));
        assert!(events.last().unwrap().is_result());
        channel.close().await;
    }

    #[tokio::test]
    async fn sequential_turns_reuse_the_process() {
        let dir = TempDir::new().unwrap();
        let handler = Arc::new(Recorder {
            requests: std::sync::Mutex::new(Vec::new()),
        });
        let channel =
            AgentChannel::spawn(SessionId::generate(), fake_agent(&dir, ECHO_AGENT), handler)
                .unwrap();

        for _ in 0..2 {
            let mut turn = channel.begin_turn("again").await.unwrap();
            let events = collect_turn(&mut turn).await;
            assert!(events.last().unwrap().is_result());
        }
        channel.close().await;
    }

    #[tokio::test]
    async fn permission_request_reaches_handler_and_unblocks_the_turn() {
        let dir = TempDir::new().unwrap();
        let handler = Arc::new(Recorder {
            requests: std::sync::Mutex::new(Vec::new()),
        });
        let channel = AgentChannel::spawn(
            SessionId::generate(),
            fake_agent(&dir, PERMISSION_AGENT),
            Arc::clone(&handler) as Arc<dyn PermissionHandler>,
        )
        .unwrap();

        let mut turn = channel.begin_turn("run ls").await.unwrap();
        let events = collect_turn(&mut turn).await;
        drop(turn);

        assert!(events.last().unwrap().is_result());
        let requests = handler.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].tool_name, "Bash");
        assert_eq!(requests[0].tool_use_id.as_deref(), Some("t1"));
        channel.close().await;
    }

    #[tokio::test]
    async fn staleness_tracks_record_file_growth() {
        let dir = TempDir::new().unwrap();
        let options = fake_agent(&dir, ECHO_AGENT);
        std::fs::write(&options.record_file, b"{}\n").unwrap();
        let handler = Arc::new(Recorder {
            requests: std::sync::Mutex::new(Vec::new()),
        });
        let channel =
            AgentChannel::spawn(SessionId::generate(), options.clone(), handler).unwrap();

        assert!(!channel.is_stale());
        // A third party appends to the record file.
        std::fs::write(&options.record_file, b"{}\n{\"x\":1}\n").unwrap();
        assert!(channel.is_stale());
        // After an own turn the new size is recorded and the mismatch clears.
        channel.record_self_size();
        assert!(!channel.is_stale());
        channel.mark_stale();
        assert!(channel.is_stale());
        channel.close().await;
    }

    #[test]
    fn size_change_requires_both_sides_known() {
        assert!(!size_changed(0, 100));
        assert!(!size_changed(100, 0));
        assert!(!size_changed(100, 100));
        assert!(size_changed(100, 200));
    }
}
