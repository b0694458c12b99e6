use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::command::PlatformCommand;
use crate::error::{Result, RotorError};

/// How long to wait for the output readers once the process is gone. A killed
/// process can leave grandchildren holding the pipes open.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandExit {
    Code(i32),
    /// The process outlived its budget and was killed.
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit: CommandExit,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit == CommandExit::Code(0)
    }

    /// Most useful text to surface when the command did not succeed.
    pub fn failure_detail(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.exit {
            CommandExit::Code(code) => format!("exited with status {code}"),
            CommandExit::Timeout => "timed out".to_string(),
        }
    }
}

/// Executes platform CLI invocations.
///
/// Every call is an independent child process; callers may run several at once.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &PlatformCommand, timeout: Duration) -> Result<CommandOutput>;
}

/// Runs the platform CLI as a child process.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: String,
    prefix_args: Vec<String>,
}

impl ProcessRunner {
    /// `argv` is the CLI prefix, e.g. `["modal"]` or `["python", "-m", "modal"]`.
    pub fn new(argv: &[String]) -> Result<Self> {
        let (program, prefix_args) = argv.split_first().ok_or_else(|| {
            RotorError::InvalidInput("platform CLI command must not be empty".to_string())
        })?;
        Ok(Self {
            program: program.clone(),
            prefix_args: prefix_args.to_vec(),
        })
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &PlatformCommand, timeout: Duration) -> Result<CommandOutput> {
        let mut process = TokioCommand::new(&self.program);
        process
            .args(&self.prefix_args)
            .args(command.args())
            .envs(command.envs())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(command = %command, timeout_secs = timeout.as_secs(), "Running platform command.");

        let mut child = process
            .spawn()
            .map_err(|e| RotorError::Command(format!("failed to spawn '{command}': {e}")))?;

        let stdout_task = child.stdout.take().map(|s| tokio::spawn(collect_output(s)));
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(collect_output(s)));

        let exit = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => CommandExit::Code(status.code().unwrap_or(-1)),
                Err(e) => {
                    error!(command = %command, error = %e, "Failed to wait for platform command.");
                    return Err(RotorError::Command(format!("failed to wait for '{command}': {e}")));
                }
            },
            _ = tokio::time::sleep(timeout) => {
                warn!(command = %command, "Platform command exceeded its budget; killing it.");
                if let Err(e) = child.kill().await {
                    error!(command = %command, error = %e, "Failed to kill timed out command.");
                }
                CommandExit::Timeout
            }
        };

        let stdout = join_output(stdout_task).await;
        let stderr = join_output(stderr_task).await;

        info!(command = %command, exit = ?exit, "Platform command finished.");
        Ok(CommandOutput {
            exit,
            stdout,
            stderr,
        })
    }
}

async fn collect_output(stream: impl AsyncRead + Unpin) -> String {
    let mut reader = BufReader::new(stream);
    let mut collected = String::new();
    let mut buffer = Vec::new();
    while let Ok(bytes_read) = reader.read_until(b'\n', &mut buffer).await {
        if bytes_read == 0 {
            break;
        }
        collected.push_str(&String::from_utf8_lossy(&buffer));
        buffer.clear();
    }
    collected
}

async fn join_output(task: Option<JoinHandle<String>>) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    match tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut task).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader task failed.");
            String::new()
        }
        Err(_) => {
            task.abort();
            String::new()
        }
    }
}
