//! Typed external-process invocation.
//!
//! Every git, `gh` and agent call goes through [`CommandSpec`]: an explicit
//! argument vector (no shell), an optional timeout, and a captured
//! [`CommandOutput`]. Children are spawned with `kill_on_drop`, so a timeout or
//! cancellation terminates the process instead of leaking it.

use crate::errors::PhaseError;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Builder for a single external command.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: String,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
    timeout: Option<Duration>,
}

/// Captured result of a finished (or killed) command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal, timeout or cancellation.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stdout and stderr joined, for scanning agent output.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
            timeout: None,
        }
    }

    /// Shorthand for `git <args>` in `cwd`.
    pub fn git<I, S>(cwd: &Path, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self::new("git").current_dir(cwd).args(args)
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Human-readable rendering for logs. Never fed back to a shell.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.to_string_lossy());
        }
        out
    }

    /// Run to completion, honouring the timeout if one is set.
    pub async fn run(&self) -> Result<CommandOutput, PhaseError> {
        self.run_cancellable(&CancellationToken::new()).await
    }

    /// Run to completion, or until the timeout elapses or `cancel` fires.
    ///
    /// Timeouts and cancellation are reported through the output flags, not as
    /// errors; only a failure to spawn is an `Err`.
    pub async fn run_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, PhaseError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        tracing::debug!(command = %self.display(), "spawning");
        let start = Instant::now();
        let child = cmd.spawn().map_err(|source| PhaseError::SpawnFailed {
            program: self.program.clone(),
            source,
        })?;

        let wait = child.wait_with_output();
        let sleep = async {
            match self.timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };

        // Dropping `wait` on timeout/cancel drops the child, which kills it.
        tokio::select! {
            result = wait => {
                let output = result.map_err(|source| PhaseError::SpawnFailed {
                    program: self.program.clone(),
                    source,
                })?;
                Ok(CommandOutput {
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    duration: start.elapsed(),
                    timed_out: false,
                    cancelled: false,
                })
            }
            _ = sleep => Ok(CommandOutput::interrupted(start.elapsed(), true, false)),
            _ = cancel.cancelled() => Ok(CommandOutput::interrupted(start.elapsed(), false, true)),
        }
    }
}

impl CommandOutput {
    fn interrupted(duration: Duration, timed_out: bool, cancelled: bool) -> Self {
        Self {
            code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration,
            timed_out,
            cancelled,
        }
    }
}
