//! Terminal agent: runs `terminalCommand` envelopes through a command executor.
//!
//! Provides controlled command execution with:
//! - Readiness polling before the first command
//! - Timeout enforcement
//! - Output capture and truncation
//! - Blocked command patterns

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ExecutorError;
use crate::message::{AgentEndpoint, Envelope, MessageKind, agents};

/// Maximum output size before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Default command timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// How long to wait for the executor to report ready.
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Commands that are always refused.
const BLOCKED_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    ":(){ :|:& };:",
    "dd if=/dev/zero",
    "mkfs",
    "chmod -r 777 /",
    "> /dev/sda",
    "curl | sh",
    "wget | sh",
    "curl | bash",
    "wget | bash",
    "sudo ",
    "doas ",
    "/etc/shadow",
    "id_rsa",
];

/// Result of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub output: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Output text, with the exit code appended on failure.
    pub fn render(&self) -> String {
        if self.success() {
            self.output.clone()
        } else if self.output.is_empty() {
            format!("[exit code {}]", self.exit_code)
        } else {
            format!("{}\n[exit code {}]", self.output.trim_end(), self.exit_code)
        }
    }
}

/// Runs terminal commands.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &str) -> Result<CommandOutput, ExecutorError>;

    /// Whether the executor can accept commands yet.
    async fn is_ready(&self) -> bool {
        true
    }
}

/// Executes commands with a local shell (`<shell> -c <command>`).
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl ShellExecutor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            working_dir: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Set the command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn blocked_pattern(command: &str) -> Option<&'static str> {
        let normalized = command.to_lowercase();
        BLOCKED_PATTERNS
            .iter()
            .find(|pattern| normalized.contains(*pattern))
            .copied()
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn run(&self, command: &str) -> Result<CommandOutput, ExecutorError> {
        if let Some(pattern) = Self::blocked_pattern(command) {
            warn!(pattern, "Refusing blocked command");
            return Err(ExecutorError::Blocked {
                reason: format!("contains {pattern:?}"),
            });
        }

        let mut cmd = Command::new(&self.shell);
        cmd.args(["-c", command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| ExecutorError::SpawnFailed(e.to_string()))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(timeout = ?self.timeout, "Command timed out");
                return Err(ExecutorError::Timeout {
                    timeout: self.timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let text = if stderr.is_empty() {
            stdout.into_owned()
        } else if stdout.is_empty() {
            stderr.into_owned()
        } else {
            format!("{stdout}\n\n--- stderr ---\n{stderr}")
        };

        Ok(CommandOutput {
            output: truncate_output(&text),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

/// Truncate at a char boundary below `MAX_OUTPUT_SIZE`.
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s.to_string();
    }
    let mut end = MAX_OUTPUT_SIZE;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (output truncated)", &s[..end])
}

pub struct TerminalAgent {
    executor: Arc<dyn CommandExecutor>,
    ready_timeout: Duration,
}

impl TerminalAgent {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    /// Builder: bound on the readiness wait.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Poll the executor until it reports ready or the timeout passes.
    pub async fn wait_until_ready(&self) -> Result<(), ExecutorError> {
        let started = tokio::time::Instant::now();
        loop {
            if self.executor.is_ready().await {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= self.ready_timeout {
                warn!(waited = ?waited, "Command executor never became ready");
                return Err(ExecutorError::NotReady { waited });
            }
            tokio::time::sleep(READY_POLL_INTERVAL.min(self.ready_timeout - waited)).await;
        }
    }

    /// Run one command once the executor is ready.
    pub async fn execute(&self, command: &str) -> Result<CommandOutput, ExecutorError> {
        self.wait_until_ready().await?;
        info!(command = %command, "Running terminal command");
        let output = self.executor.run(command).await?;
        debug!(exit_code = output.exit_code, bytes = output.output.len(), "Terminal command finished");
        Ok(output)
    }

    pub async fn process_agent_message(&self, envelope: Envelope) -> Envelope {
        match envelope.kind() {
            MessageKind::TerminalCommand => match self.execute(envelope.content()).await {
                Ok(output) => envelope
                    .reply(MessageKind::TerminalOutput, output.render())
                    .with_metadata("exitCode", output.exit_code.to_string()),
                Err(e) => {
                    warn!(error = %e, "Terminal command failed");
                    envelope.reply(MessageKind::Error, e.to_string())
                }
            },
            other => {
                warn!(kind = %other, sender = %envelope.sender(), "Terminal agent cannot handle message kind");
                envelope.unhandled(agents::TERMINAL)
            }
        }
    }
}

#[async_trait]
impl AgentEndpoint for TerminalAgent {
    fn name(&self) -> &str {
        agents::TERMINAL
    }

    async fn handle(&self, envelope: Envelope) -> Envelope {
        self.process_agent_message(envelope).await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Executor that echoes commands back and becomes ready after some polls.
    #[derive(Default)]
    pub struct ScriptedExecutor {
        pub polls_until_ready: AtomicU32,
        pub commands: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        pub fn ready_after(polls: u32) -> Self {
            Self {
                polls_until_ready: AtomicU32::new(polls),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn run(&self, command: &str) -> Result<CommandOutput, ExecutorError> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(CommandOutput {
                output: format!("ran: {command}"),
                exit_code: 0,
            })
        }

        async fn is_ready(&self) -> bool {
            let remaining = self.polls_until_ready.load(Ordering::SeqCst);
            if remaining == 0 {
                return true;
            }
            self.polls_until_ready.store(remaining - 1, Ordering::SeqCst);
            false
        }
    }
}
