//! External process handler.
//!
//! Runs a collaborator program for a capability:
//! - JSON arguments written to stdin
//! - JSON result read from stdout
//! - Timeout enforcement (the process is killed on expiry)
//! - Output capture capped in size (excess is drained, not left in the pipe)

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};

use crate::error::HandlerError;
use crate::stages::handler::StageHandler;
use crate::workflow::evaluation::extract_json_object;

/// Maximum output size read from a collaborator (1MB).
const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Default collaborator timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Handler backed by an external program.
#[derive(Debug)]
pub struct CommandHandler {
    name: String,
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl CommandHandler {
    /// Create a handler for `capability` that runs `program`.
    pub fn new(capability: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: capability.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Parse a whitespace-separated command line (`program arg1 arg2`).
    pub fn from_command_line(capability: impl Into<String>, line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(capability, program).with_args(parts.map(str::to_string)))
    }

    pub fn with_args<I: IntoIterator<Item = String>>(mut self, args: I) -> Self {
        self.args.extend(args);
        self
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Set the process timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run_process(&self, input: Vec<u8>) -> Result<(String, String, i32), HandlerError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| HandlerError::ExecutionFailed {
            name: self.name.clone(),
            reason: format!("failed to spawn {}: {}", self.program, e),
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let result = tokio::time::timeout(self.timeout, async {
            // All three pipes progress together so a chatty collaborator
            // never blocks on a full buffer we are not reading.
            let (_, stdout, stderr) = tokio::try_join!(
                feed_stdin(stdin, input),
                read_capped(stdout),
                read_capped(stderr)
            )?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((
                String::from_utf8_lossy(&stdout).to_string(),
                String::from_utf8_lossy(&stderr).to_string(),
                status.code().unwrap_or(-1),
            ))
        })
        .await;

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(HandlerError::ExecutionFailed {
                name: self.name.clone(),
                reason: format!("process I/O failed: {}", e),
            }),
            Err(_) => {
                let _ = child.kill().await;
                Err(HandlerError::Timeout {
                    name: self.name.clone(),
                    timeout: self.timeout,
                })
            }
        }
    }
}

#[async_trait]
impl StageHandler for CommandHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, args: Value) -> Result<Value, HandlerError> {
        let input = serde_json::to_vec(&args)?;
        let start = std::time::Instant::now();
        let (stdout, stderr, code) = self.run_process(input).await?;
        tracing::debug!(
            capability = %self.name,
            exit_code = code,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Collaborator process finished"
        );

        if code != 0 {
            let detail = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            return Err(HandlerError::ExecutionFailed {
                name: self.name.clone(),
                reason: format!("exit code {}: {}", code, truncate(detail, 500)),
            });
        }

        let json = extract_json_object(&stdout);
        serde_json::from_str(&json).map_err(|e| HandlerError::InvalidOutput {
            name: self.name.clone(),
            reason: format!("stdout is not JSON ({}): {}", e, truncate(stdout.trim(), 200)),
        })
    }
}

/// Write the arguments and close stdin. A collaborator that exits without
/// reading its input is not an error.
async fn feed_stdin(stdin: Option<ChildStdin>, input: Vec<u8>) -> std::io::Result<()> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };
    let written = async {
        stdin.write_all(&input).await?;
        stdin.shutdown().await
    }
    .await;
    match written {
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

/// Read a pipe to EOF, keeping at most `MAX_OUTPUT_SIZE` bytes. The rest is
/// drained and discarded so the writer is never left blocked.
async fn read_capped<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut kept = Vec::new();
    let Some(mut pipe) = pipe else {
        return Ok(kept);
    };
    let mut chunk = [0u8; 8192];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            return Ok(kept);
        }
        let room = MAX_OUTPUT_SIZE - kept.len();
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}
