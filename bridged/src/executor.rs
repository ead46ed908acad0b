//! Subprocess drivers for the supported code-generation CLIs.
//!
//! The daemon talks to executors through the [`Executor`] trait so tests
//! can substitute a stub; the real implementation spawns `codex` or
//! `gemini`, feeds the prompt over stdin and captures both output
//! streams with a hard size cap.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

/// Per-stream capture cap. Anything past this is drained and dropped so
/// the child never blocks on a full pipe.
pub const MAX_CAPTURE_BYTES: usize = 10 * 1024 * 1024;

const DEFAULT_CODEX_MODEL: &str = "gpt-5.3-codex";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    Codex,
    Gemini,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }
}

/// One task execution: the prompt to feed and the bounds to enforce.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
}

/// A started run: a signal handle usable while the run is in flight, and
/// the supervision task resolving to the final response text.
pub struct Execution {
    pub handle: ExecHandle,
    pub result: JoinHandle<Result<String>>,
}

/// Signal-based control over the executor process. The child itself is
/// owned by the supervision task, so termination goes through the pid.
#[derive(Debug, Clone, Copy)]
pub struct ExecHandle {
    pid: Option<i32>,
}

impl ExecHandle {
    /// Handle with no underlying process; signals are no-ops.
    pub fn detached() -> Self {
        Self { pid: None }
    }

    pub fn terminate(&self) {
        self.signal(Signal::SIGTERM);
    }

    pub fn force_kill(&self) {
        self.signal(Signal::SIGKILL);
    }

    pub fn is_alive(&self) -> bool {
        match self.pid {
            Some(pid) => kill(Pid::from_raw(pid), None).is_ok(),
            None => false,
        }
    }

    fn signal(&self, signal: Signal) {
        if let Some(pid) = self.pid {
            if let Err(err) = kill(Pid::from_raw(pid), signal) {
                debug!(pid, %signal, %err, "signal delivery failed");
            }
        }
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn start(&self, request: ExecRequest) -> Result<Execution>;
}

pub struct CliExecutor {
    kind: ExecutorKind,
}

impl CliExecutor {
    pub fn new(kind: ExecutorKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Executor for CliExecutor {
    async fn start(&self, request: ExecRequest) -> Result<Execution> {
        let kind = self.kind;
        let mut command = command_for(kind, request.model.as_deref());
        command
            .current_dir(&request.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {} executor", kind.as_str()))?;
        let handle = ExecHandle {
            pid: child.id().map(|pid| pid as i32),
        };

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("executor stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("executor stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("executor stderr unavailable"))?;

        let prompt = request.prompt;
        let timeout = request.timeout;
        let result = tokio::spawn(async move {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .context("failed to write prompt to executor stdin")?;
            drop(stdin);

            let stdout_task = tokio::spawn(read_capped(stdout));
            let stderr_task = tokio::spawn(read_capped(stderr));

            let status = match time::timeout(timeout, child.wait()).await {
                Ok(waited) => waited.context("failed to wait for executor process")?,
                Err(_) => {
                    handle.terminate();
                    bail!("executor timed out after {}ms", timeout.as_millis());
                }
            };

            let stdout_text = stdout_task.await.unwrap_or_default();
            let stderr_text = stderr_task.await.unwrap_or_default();

            // A non-zero exit with usable stdout still counts as success:
            // the CLIs routinely exit non-zero after producing a complete
            // answer.
            if status.success() || !stdout_text.trim().is_empty() {
                let response = match kind {
                    ExecutorKind::Codex => parse_codex_output(&stdout_text),
                    ExecutorKind::Gemini => stdout_text.trim().to_string(),
                };
                return Ok(response);
            }

            let detail = if stderr_text.trim().is_empty() {
                "No output".to_string()
            } else {
                stderr_text.trim().to_string()
            };
            bail!(
                "executor exited with {}: {}",
                status
                    .code()
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                detail
            );
        });

        Ok(Execution { handle, result })
    }
}

fn command_for(kind: ExecutorKind, model: Option<&str>) -> Command {
    match kind {
        ExecutorKind::Codex => {
            let mut command = Command::new("codex");
            command
                .arg("exec")
                .arg("-m")
                .arg(model.unwrap_or(DEFAULT_CODEX_MODEL))
                .arg("--json")
                .arg("--full-auto");
            command
        }
        ExecutorKind::Gemini => {
            let mut command = Command::new("gemini");
            command.arg("--yolo");
            if let Some(model) = model {
                command.arg("--model").arg(model);
            }
            command
        }
    }
}

/// Drain a stream to EOF, keeping at most [`MAX_CAPTURE_BYTES`].
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut captured = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = MAX_CAPTURE_BYTES.saturating_sub(captured.len());
                if room > 0 {
                    captured.extend_from_slice(&chunk[..n.min(room)]);
                }
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&captured).into_owned()
}

/// Event stream emitted by `codex exec --json`: one JSON object per line.
/// Only agent-visible text is kept; tool calls, token counts and unknown
/// event types are skipped. Unparsable lines are skipped too, since the
/// stream interleaves diagnostics with events.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum CodexEvent {
    #[serde(rename = "item.completed")]
    ItemCompleted { item: CodexItem },
    #[serde(rename = "message")]
    Message { content: CodexContent },
    #[serde(rename = "output_text")]
    OutputText { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct CodexItem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CodexContent {
    Text(String),
    Parts(Vec<CodexPart>),
}

#[derive(Debug, Deserialize)]
struct CodexPart {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Extract the agent's message text from a codex JSONL transcript. Falls
/// back to the raw output when no recognizable message events are found,
/// so a format drift degrades to verbosity instead of silence.
pub fn parse_codex_output(output: &str) -> String {
    let mut texts = Vec::new();
    for line in output.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Ok(event) = serde_json::from_str::<CodexEvent>(line) else {
            continue;
        };
        match event {
            CodexEvent::ItemCompleted { item } => {
                if item.kind == "agent_message" {
                    if let Some(text) = item.text {
                        texts.push(text);
                    }
                }
            }
            CodexEvent::Message { content } => match content {
                CodexContent::Text(text) => texts.push(text),
                CodexContent::Parts(parts) => {
                    for part in parts {
                        if part.kind == "text" {
                            if let Some(text) = part.text {
                                texts.push(text);
                            }
                        }
                    }
                }
            },
            CodexEvent::OutputText { text } => texts.push(text),
            CodexEvent::Other => {}
        }
    }
    if texts.is_empty() {
        output.to_string()
    } else {
        texts.join("\n")
    }
}
