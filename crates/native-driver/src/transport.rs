//! Driver subprocess ownership.
//!
//! Spawns the driver with stdin/stdout piped as the protocol channel. Stderr
//! is diagnostic only: each line is forwarded to tracing and never parsed, and
//! it is read until EOF whatever bytes it carries.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::StreamExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};

use crate::config::DriverConfig;
use crate::error::StartupError;

/// Handle to a running driver process. Stdio pipes are handed out at spawn.
#[derive(Debug)]
pub struct DriverProcess {
    child: Child,
    program: String,
}

impl DriverProcess {
    /// Spawn the driver and watch it for `config.startup_window`.
    ///
    /// A process that exits inside the window fails with
    /// [`StartupError::ExitedImmediately`].
    pub async fn spawn(
        config: &DriverConfig,
    ) -> Result<(Self, ChildStdin, ChildStdout), StartupError> {
        let program = config.program.display().to_string();

        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .envs(config.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(StartupError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or(StartupError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(StartupError::MissingPipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr, program.clone());
        }

        // Stdin is already taken, so waiting here cannot close it.
        match tokio::time::timeout(config.startup_window, child.wait()).await {
            Ok(Ok(status)) => return Err(StartupError::ExitedImmediately(status)),
            Ok(Err(e)) => return Err(StartupError::Spawn(e)),
            Err(_) => {}
        }

        tracing::info!(%program, pid = ?child.id(), "Driver started");
        Ok((Self { child, program }, stdin, stdout))
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Reap the process if it has already exited.
    pub fn try_exited(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(program = %self.program, error = %e, "Failed to poll driver status");
                None
            }
        }
    }

    /// Wait up to `grace` for a voluntary exit, then kill.
    ///
    /// Callers close stdin first; a well-behaved driver exits on EOF.
    pub async fn terminate(mut self, grace: Duration) -> io::Result<ExitStatus> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(program = %self.program, %status, "Driver exited");
                Ok(status)
            }
            Ok(Err(e)) => {
                tracing::warn!(program = %self.program, error = %e, "Failed to wait for driver, killing");
                self.kill().await
            }
            Err(_) => {
                tracing::warn!(
                    program = %self.program,
                    grace_ms = grace.as_millis() as u64,
                    "Driver did not exit within grace period, killing"
                );
                self.kill().await
            }
        }
    }

    async fn kill(&mut self) -> io::Result<ExitStatus> {
        self.child.kill().await?;
        let status = self.child.wait().await?;
        tracing::info!(program = %self.program, %status, "Driver killed");
        Ok(status)
    }
}

fn forward_stderr(stderr: ChildStderr, program: String) {
    tokio::spawn(async move {
        let codec = AnyDelimiterCodec::new(b"\n".to_vec(), Vec::new());
        let mut lines = FramedRead::new(stderr, codec);
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    let line = String::from_utf8_lossy(&line);
                    let trimmed = line.trim_end();
                    if !trimmed.is_empty() {
                        tracing::debug!(target: "native_driver::stderr", %program, "{}", trimmed);
                    }
                }
                Err(e) => {
                    tracing::debug!(%program, error = %e, "Stopped forwarding driver stderr");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let config = DriverConfig::new("/nonexistent/driver/bin/native");
        let err = DriverProcess::spawn(&config).await.unwrap_err();
        assert!(matches!(err, StartupError::Spawn(_)));
    }

    #[tokio::test]
    async fn early_exit_fails_spawn() {
        let config = DriverConfig::new("sh")
            .with_args(["-c", "exit 7"])
            .with_startup_window(Duration::from_secs(5));

        let started = tokio::time::Instant::now();
        match DriverProcess::spawn(&config).await {
            Err(StartupError::ExitedImmediately(status)) => assert_eq!(status.code(), Some(7)),
            other => panic!("expected early exit, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn non_utf8_stderr_does_not_break_the_pipe() {
        let script = r"printf '\377\n' >&2; sleep 0.3; echo hello >&2; read _line; echo done";
        let config = DriverConfig::new("sh").with_args(["-c", script]);
        let (process, mut stdin, stdout) = DriverProcess::spawn(&config).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        stdin.write_all(b"go\n").await.unwrap();
        let codec = AnyDelimiterCodec::new(b"\n".to_vec(), Vec::new());
        let mut lines = FramedRead::new(stdout, codec);
        let line = lines.next().await.unwrap().unwrap();
        assert_eq!(&line[..], b"done");

        drop(stdin);
        let status = process.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn closing_stdin_lets_driver_exit() {
        let (process, stdin, _stdout) = DriverProcess::spawn(&DriverConfig::new("cat"))
            .await
            .unwrap();
        assert!(process.id().is_some());

        drop(stdin);
        let status = process.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn stubborn_driver_is_killed_after_grace() {
        let config = DriverConfig::new("sleep").with_args(["30"]);
        let (process, stdin, _stdout) = DriverProcess::spawn(&config).await.unwrap();
        drop(stdin);

        let started = tokio::time::Instant::now();
        let status = process.terminate(Duration::from_millis(100)).await.unwrap();

        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn exit_is_observed_after_the_fact() {
        let config = DriverConfig::new("sh").with_args(["-c", "read _line; exit 3"]);
        let (mut process, stdin, _stdout) = DriverProcess::spawn(&config).await.unwrap();
        drop(stdin);

        let mut status = None;
        for _ in 0..100 {
            status = process.try_exited();
            if status.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status.and_then(|s| s.code()), Some(3));
    }
}
