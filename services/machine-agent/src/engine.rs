//! Execution engine abstraction.
//!
//! The engine is the collaborator that actually carries out a task's
//! instructions. It pushes each message it produces into a channel and
//! returns once it has finished, or fails. Timeouts and cancellation are
//! enforced by the executor by dropping the future, so implementations must
//! release their resources on drop.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cloudagent_wire::RunOptions;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Bytes of stderr kept for error reports.
const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start engine: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("engine i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine exited with {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },

    /// The engine finished but reported the task as failed.
    #[error("{0}")]
    Reported(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Everything an engine needs to run one task.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub task_id: String,
    pub instructions: String,
    pub options: RunOptions,
    pub working_dir: PathBuf,
}

/// Engine trait for running task instructions.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Runs the task to completion, sending every produced message to `sink`.
    ///
    /// A closed sink is not an error; the engine keeps running.
    async fn execute(&self, request: EngineRequest, sink: mpsc::Sender<Value>) -> EngineResult<()>;
}

/// Runs an external agent CLI in the task's working directory.
///
/// Each stdout line that parses as JSON is forwarded as-is; anything else is
/// wrapped as `{"type":"text","text":...}`. A `result` message with
/// `is_error: true` fails the task even if the process exits cleanly.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    base_args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }

    fn command(&self, request: &EngineRequest) -> Command {
        let tools = request
            .options
            .allowed_tools
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .arg("--print")
            .arg(&request.instructions)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--max-turns")
            .arg(request.options.max_turns.to_string())
            .arg("--allowedTools")
            .arg(tools)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Drains `reader`, keeping only its last `limit` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut tail = VecDeque::with_capacity(limit);
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let keep = &chunk[n.saturating_sub(limit)..n];
                let overflow = (tail.len() + keep.len()).saturating_sub(limit);
                tail.drain(..overflow);
                tail.extend(keep);
            }
        }
    }
    let bytes: Vec<u8> = tail.into();
    String::from_utf8_lossy(&bytes).trim().to_string()
}

#[async_trait]
impl Engine for CommandEngine {
    async fn execute(&self, request: EngineRequest, sink: mpsc::Sender<Value>) -> EngineResult<()> {
        tokio::fs::create_dir_all(&request.working_dir).await?;

        let mut child = self.command(&request).spawn().map_err(EngineError::Spawn)?;
        info!(task_id = %request.task_id, program = %self.program, "Engine started");

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            match stderr {
                Some(stderr) => read_tail(stderr, STDERR_TAIL_BYTES).await,
                None => String::new(),
            }
        });

        let mut reported_error = None;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                let message = parse_line(&line);
                if let Some(error) = reported_failure(&message) {
                    reported_error = Some(error);
                }
                // Keep draining stdout even if nobody is listening.
                let _ = sink.send(message).await;
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        debug!(task_id = %request.task_id, ?status, "Engine exited");

        if !status.success() {
            return Err(EngineError::Exited {
                code: status.code(),
                stderr,
            });
        }
        if let Some(error) = reported_error {
            return Err(EngineError::Reported(error));
        }
        Ok(())
    }
}

fn parse_line(line: &str) -> Value {
    serde_json::from_str(line).unwrap_or_else(|_| serde_json::json!({ "type": "text", "text": line }))
}

fn reported_failure(message: &Value) -> Option<String> {
    let is_result = message.get("type").and_then(Value::as_str) == Some("result");
    let is_error = message.get("is_error").and_then(Value::as_bool) == Some(true);
    if !(is_result && is_error) {
        return None;
    }
    let text = message
        .get("result")
        .and_then(Value::as_str)
        .unwrap_or("Engine reported an error");
    Some(text.to_string())
}

/// Scripted engine for tests and local development.
#[derive(Debug, Default)]
pub struct MockEngine {
    messages: Vec<Value>,
    delay: Duration,
    failure: Option<String>,
    stalled: bool,
    runs: AtomicU64,
}

impl MockEngine {
    /// An engine that emits `messages` and succeeds.
    pub fn new(messages: Vec<Value>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// An engine that emits nothing and fails with `error`.
    pub fn failing(error: impl Into<String>) -> Self {
        Self {
            failure: Some(error.into()),
            ..Self::default()
        }
    }

    /// An engine that emits its messages and then never finishes.
    pub fn stalled(messages: Vec<Value>) -> Self {
        Self {
            messages,
            stalled: true,
            ..Self::default()
        }
    }

    /// Sleep before each message.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of times `execute` has been called.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn execute(&self, request: EngineRequest, sink: mpsc::Sender<Value>) -> EngineResult<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        info!(task_id = %request.task_id, "[MOCK] Executing task");

        for message in &self.messages {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let _ = sink.send(message.clone()).await;
        }

        if self.stalled {
            std::future::pending::<()>().await;
        }

        match &self.failure {
            Some(error) => Err(EngineError::Reported(error.clone())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &std::path::Path) -> EngineRequest {
        EngineRequest {
            task_id: "t1".to_string(),
            instructions: "say hi".to_string(),
            options: RunOptions::default(),
            working_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_parse_line_wraps_plain_text() {
        assert_eq!(parse_line(r#"{"type":"assistant"}"#)["type"], "assistant");
        let wrapped = parse_line("hello");
        assert_eq!(wrapped["type"], "text");
        assert_eq!(wrapped["text"], "hello");
    }

    #[test]
    fn test_reported_failure_only_for_error_results() {
        let ok = serde_json::json!({"type": "result", "is_error": false, "result": "done"});
        assert!(reported_failure(&ok).is_none());

        let failed = serde_json::json!({"type": "result", "is_error": true, "result": "max turns"});
        assert_eq!(reported_failure(&failed).as_deref(), Some("max turns"));
    }

    #[tokio::test]
    async fn test_mock_engine_emits_messages() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MockEngine::new(vec![serde_json::json!({"n": 1}), serde_json::json!({"n": 2})]);
        let (tx, mut rx) = mpsc::channel(8);

        engine.execute(request(dir.path()), tx).await.unwrap();

        assert_eq!(rx.recv().await.unwrap()["n"], 1);
        assert_eq!(rx.recv().await.unwrap()["n"], 2);
        assert!(rx.recv().await.is_none());
        assert_eq!(engine.runs(), 1);
    }

    #[tokio::test]
    async fn test_mock_engine_failing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MockEngine::failing("nope");
        let (tx, _rx) = mpsc::channel(8);

        let err = engine.execute(request(dir.path()), tx).await.unwrap_err();
        assert!(matches!(err, EngineError::Reported(ref e) if e == "nope"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_engine_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        // `sh -c 'exit 3' --print ...`: the per-task args land in $0.. and are ignored.
        let engine = CommandEngine::new("sh", vec!["-c".to_string(), "echo out; exit 3".to_string()]);
        let (tx, mut rx) = mpsc::channel(8);

        let err = engine.execute(request(dir.path()), tx).await.unwrap_err();
        assert!(matches!(err, EngineError::Exited { code: Some(3), .. }));
        assert_eq!(rx.recv().await.unwrap()["text"], "out");
    }

    #[tokio::test]
    async fn test_stderr_tail_keeps_only_last_bytes() {
        let noise = format!("{}the real error\n", "x".repeat(10_000));
        assert_eq!(read_tail(noise.as_bytes(), 15).await, "the real error");
        assert_eq!(read_tail(&b"  short\n"[..], 2048).await, "short");
        assert_eq!(read_tail(&b""[..], 16).await, "");
    }
}
