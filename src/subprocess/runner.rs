use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::error::ProcessError;

/// A program invocation, independent of how it is run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Variables set for the child only, on top of the inherited environment
    pub env: Vec<(String, OsString)>,
    pub timeout: Option<Duration>,
}

impl ProcessCommand {
    /// Shell-like rendering for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a command that ran to completion
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Error(i32),
    Signal(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        *self == ExitStatus::Success
    }

    pub fn code(&self) -> Option<i32> {
        match *self {
            ExitStatus::Success => Some(0),
            ExitStatus::Error(code) => Some(code),
            ExitStatus::Signal(_) => None,
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        if status.success() {
            return ExitStatus::Success;
        }
        if let Some(code) = status.code() {
            return ExitStatus::Error(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitStatus::Signal(signal);
            }
        }
        ExitStatus::Error(1)
    }
}

/// Runs short-lived commands such as the scheduler tools
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError>;
}

/// [`ProcessRunner`] backed by `tokio::process`
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    fn command(command: &ProcessCommand) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null());
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        // Own process group, so a terminal interrupt reaches only the orchestrator
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }
        cmd
    }

    fn spawn_error(error: std::io::Error, program: &str) -> ProcessError {
        match error.kind() {
            std::io::ErrorKind::NotFound => ProcessError::CommandNotFound(program.to_string()),
            _ => ProcessError::Io(error),
        }
    }

    /// Start a long-running child without waiting for it
    ///
    /// Output goes to the given files so that a detached worker keeps its log
    /// even if this process goes away.
    pub fn spawn_detached(
        command: &ProcessCommand,
        stdout: std::fs::File,
        stderr: std::fs::File,
    ) -> Result<tokio::process::Child, ProcessError> {
        debug!("Spawning detached: {}", command.display());
        Self::command(command)
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| Self::spawn_error(e, &command.program))
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        debug!("Running: {}", command.display());
        let started = Instant::now();

        let child = Self::command(&command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Self::spawn_error(e, &command.program))?;

        let waited = child.wait_with_output();
        let output = match command.timeout {
            Some(limit) => tokio::time::timeout(limit, waited)
                .await
                .map_err(|_| ProcessError::Timeout(limit))??,
            None => waited.await?,
        };

        let result = ProcessOutput {
            status: output.status.into(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: started.elapsed(),
        };
        match result.status {
            ExitStatus::Success => {
                debug!("{} finished in {:?}", command.program, result.duration)
            }
            ExitStatus::Error(code) => {
                debug!("{} exited with {}", command.program, code);
                trace!("stderr: {}", result.stderr);
            }
            ExitStatus::Signal(signal) => {
                warn!("{} killed by signal {}", command.program, signal)
            }
        }
        Ok(result)
    }
}
