//! Driver client - public start/parse/close surface.
//!
//! Flow:
//! 1. `start` spawns the driver and wires its stdio into a [`Router`]
//! 2. `parse` takes the single-flight lock and runs one router exchange
//! 3. `close` interrupts pending calls, closes stdin, waits, then kills
//!
//! The lock is a FIFO-fair `tokio::sync::Mutex` held across drain, send and
//! receive, so answers reach callers in the order their requests were issued.

use std::fmt;

use async_trait::async_trait;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::Request;
use crate::config::DriverConfig;
use crate::error::{DriverError, FailureCause};
use crate::router::{Router, until};
use crate::transport::DriverProcess;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    NotStarted,
    Running,
    Stopped,
}

impl DriverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not started",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that turns source text into a raw driver tree.
///
/// Language adapters depend on this rather than on [`Driver`], so they can be
/// exercised without a subprocess.
#[async_trait]
pub trait NativeParser: Send + Sync {
    async fn parse(
        &self,
        source: &str,
        deadline: Option<Instant>,
    ) -> Result<serde_json::Value, DriverError>;
}

struct Session {
    process: DriverProcess,
    router: Router<ChildStdout, ChildStdin>,
}

enum DriverState {
    NotStarted,
    Running(Session),
    Stopped,
}

impl DriverState {
    fn status(&self) -> DriverStatus {
        match self {
            Self::NotStarted => DriverStatus::NotStarted,
            Self::Running(_) => DriverStatus::Running,
            Self::Stopped => DriverStatus::Stopped,
        }
    }
}

/// Client for one driver subprocess.
///
/// Instances are independent: each owns its own process and transport.
pub struct Driver {
    config: DriverConfig,
    state: Mutex<DriverState>,
    shutdown: CancellationToken,
}

impl Driver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DriverState::NotStarted),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub async fn status(&self) -> DriverStatus {
        self.state.lock().await.status()
    }

    /// Answers still owed by the driver for calls that timed out or were
    /// dropped before reading them.
    pub async fn debt(&self) -> usize {
        match &*self.state.lock().await {
            DriverState::Running(session) => session.router.owed(),
            _ => 0,
        }
    }

    pub async fn start(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock().await;
        if !matches!(*state, DriverState::NotStarted) {
            return Err(DriverError::InvalidState {
                operation: "start",
                status: state.status(),
            });
        }

        let (process, stdin, stdout) = DriverProcess::spawn(&self.config).await.inspect_err(|e| {
            tracing::error!(program = %self.config.program.display(), error = %e, "Driver failed to start");
        })?;

        *state = DriverState::Running(Session {
            process,
            router: Router::new(stdout, stdin),
        });
        Ok(())
    }

    /// Parse `source` into the driver's raw tree.
    ///
    /// With no `deadline`, the configured default timeout applies; with
    /// neither, the call waits as long as the driver takes. The deadline also
    /// bounds waiting for other callers ahead in line.
    pub async fn parse(
        &self,
        source: &str,
        deadline: Option<Instant>,
    ) -> Result<serde_json::Value, DriverError> {
        if self.shutdown.is_cancelled() {
            return Err(DriverError::InvalidState {
                operation: "parse",
                status: DriverStatus::Stopped,
            });
        }

        let request = Request::parse(source, self.config.encoding);
        let deadline = deadline.or_else(|| self.config.timeout.map(|t| Instant::now() + t));

        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(DriverError::Closed),
            result = self.exchange(request, deadline) => result,
        }
    }

    async fn exchange(
        &self,
        request: Request,
        deadline: Option<Instant>,
    ) -> Result<serde_json::Value, DriverError> {
        let Some(mut state) = until(deadline, self.state.lock()).await else {
            return Err(FailureCause::Timeout.into());
        };

        let session = match &mut *state {
            DriverState::Running(session) => session,
            other => {
                return Err(DriverError::InvalidState {
                    operation: "parse",
                    status: other.status(),
                });
            }
        };

        let result = session.router.exchange(request, deadline).await;

        // A dead driver shows up as a closed or broken pipe.
        if let Err(FailureCause::Protocol(_)) = &result
            && let Some(status) = session.process.try_exited()
        {
            tracing::warn!(program = %self.config.program.display(), %status, "Driver exited unexpectedly");
            *state = DriverState::Stopped;
        }

        result.map_err(DriverError::from)
    }

    /// Shut the driver down. Idempotent, and a no-op if it never started.
    ///
    /// Pending `parse` calls fail with [`DriverError::Closed`]. A closed
    /// driver cannot be started again.
    pub async fn close(&self) -> Result<(), DriverError> {
        self.shutdown.cancel();

        let mut state = self.state.lock().await;
        let DriverState::Running(session) = std::mem::replace(&mut *state, DriverState::Stopped)
        else {
            return Ok(());
        };

        let Session { process, router } = session;
        // Dropping the router closes stdin, which is the driver's cue to exit.
        drop(router);

        process
            .terminate(self.config.close_grace)
            .await
            .map(|_| ())
            .map_err(DriverError::Close)
    }
}

#[async_trait]
impl NativeParser for Driver {
    async fn parse(
        &self,
        source: &str,
        deadline: Option<Instant>,
    ) -> Result<serde_json::Value, DriverError> {
        Driver::parse(self, source, deadline).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::StartupError;

    #[tokio::test]
    async fn parse_before_start_is_invalid_state() {
        let driver = Driver::new(DriverConfig::new("cat"));

        let err = driver.parse("foo", None).await.unwrap_err();
        assert!(matches!(
            err,
            DriverError::InvalidState {
                operation: "parse",
                status: DriverStatus::NotStarted
            }
        ));
    }

    #[tokio::test]
    async fn close_without_start_is_noop() {
        let driver = Driver::new(DriverConfig::new("cat"));
        driver.close().await.unwrap();
        driver.close().await.unwrap();
        assert_eq!(driver.status().await, DriverStatus::Stopped);
    }

    #[tokio::test]
    async fn start_twice_is_invalid_state() {
        let driver = Driver::new(DriverConfig::new("cat"));
        driver.start().await.unwrap();

        let err = driver.start().await.unwrap_err();
        assert!(matches!(
            err,
            DriverError::InvalidState {
                operation: "start",
                status: DriverStatus::Running
            }
        ));
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_start_stays_not_started() {
        let driver = Driver::new(DriverConfig::new("/nonexistent/native"));

        assert!(matches!(driver.start().await, Err(DriverError::Startup(_))));
        assert_eq!(driver.status().await, DriverStatus::NotStarted);
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn parse_after_close_is_refused() {
        let driver = Driver::new(DriverConfig::new("cat"));
        driver.start().await.unwrap();
        driver.close().await.unwrap();

        assert_eq!(driver.status().await, DriverStatus::Stopped);
        assert!(matches!(
            driver.parse("foo", None).await,
            Err(DriverError::InvalidState {
                status: DriverStatus::Stopped,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn close_interrupts_pending_call() {
        // Never answers and never exits on its own.
        let config = DriverConfig::new("sleep")
            .with_args(["30"])
            .with_close_grace(Duration::from_millis(50));
        let driver = std::sync::Arc::new(Driver::new(config));
        driver.start().await.unwrap();

        let pending = tokio::spawn({
            let driver = std::sync::Arc::clone(&driver);
            async move { driver.parse("foo", None).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        driver.close().await.unwrap();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(DriverError::Closed)));
    }

    #[tokio::test]
    async fn early_exit_fails_start() {
        let config = DriverConfig::new("sh")
            .with_args(["-c", "exit 7"])
            .with_startup_window(Duration::from_secs(5));
        let driver = Driver::new(config);

        let err = driver.start().await.unwrap_err();
        assert!(
            matches!(err, DriverError::Startup(StartupError::ExitedImmediately(_))),
            "{err}"
        );
        assert_eq!(driver.status().await, DriverStatus::NotStarted);
    }

    #[tokio::test]
    async fn dropped_call_counts_as_debt() {
        let config = DriverConfig::new("sleep")
            .with_args(["30"])
            .with_close_grace(Duration::from_millis(50));
        let driver = Driver::new(config);
        driver.start().await.unwrap();

        let dropped =
            tokio::time::timeout(Duration::from_millis(100), driver.parse("foo", None)).await;
        assert!(dropped.is_err());
        assert_eq!(driver.debt().await, 1);

        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn default_timeout_applies_without_deadline() {
        let config = DriverConfig::new("sleep")
            .with_args(["30"])
            .with_timeout(Duration::from_millis(100))
            .with_close_grace(Duration::from_millis(50));
        let driver = Driver::new(config);
        driver.start().await.unwrap();

        let err = driver.parse("foo", None).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(driver.debt().await, 1);

        driver.close().await.unwrap();
    }
}
