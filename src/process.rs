use crate::config::Timings;
use crate::error::SaveLoopError;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, info};

/// Process enumeration and control by executable name.
pub trait ProcessHost: Send + Sync {
    fn is_running(&self, name: &str) -> impl Future<Output = crate::Result<bool>> + Send;

    /// Requests termination and returns the exit code of the kill request.
    fn kill(&self, name: &str) -> impl Future<Output = crate::Result<i32>> + Send;

    /// Starts `command` without waiting for it.
    fn spawn(&self, command: &str) -> crate::Result<()>;
}

/// `tasklist`/`taskkill` on Windows, `pgrep`/`pkill` elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessHost;

impl SystemProcessHost {
    async fn run(program: &str, args: &[&str]) -> crate::Result<std::process::Output> {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SaveLoopError::ProcessQuery(format!("{}: {}", program, e)))
    }
}

impl ProcessHost for SystemProcessHost {
    fn is_running(&self, name: &str) -> impl Future<Output = crate::Result<bool>> + Send {
        async move {
            if cfg!(target_os = "windows") {
                let filter = format!("IMAGENAME eq {}", name);
                let output = Self::run("tasklist", &["/NH", "/FI", filter.as_str()]).await?;
                let listing = String::from_utf8_lossy(&output.stdout);
                Ok(listing.lines().any(|line| line.trim_start().starts_with(name)))
            } else {
                let output = Self::run("pgrep", &["-x", name]).await?;
                Ok(output.status.success())
            }
        }
    }

    fn kill(&self, name: &str) -> impl Future<Output = crate::Result<i32>> + Send {
        async move {
            let output = if cfg!(target_os = "windows") {
                Self::run("taskkill", &["/IM", name]).await?
            } else {
                Self::run("pkill", &["-x", name]).await?
            };
            Ok(output.status.code().unwrap_or(-1))
        }
    }

    fn spawn(&self, command: &str) -> crate::Result<()> {
        let spawn_error = |reason: String| SaveLoopError::Spawn {
            command: command.to_string(),
            reason,
        };
        let words = shellwords::split(command).map_err(|e| spawn_error(e.to_string()))?;
        let (program, args) = words
            .split_first()
            .ok_or_else(|| spawn_error("empty command".to_string()))?;

        // The child is detached: dropping the handle neither waits for nor kills it.
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| spawn_error(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped { attempts: u32 },
}

/// Stops and starts the game with a bounded number of kill requests.
pub struct ProcessController<P> {
    host: P,
    initial_delay: Duration,
    retry_delay: Duration,
    max_attempts: u32,
}

impl<P: ProcessHost> ProcessController<P> {
    pub fn new(host: P, timings: &Timings) -> Self {
        Self {
            host,
            initial_delay: timings.kill_initial_delay(),
            retry_delay: timings.kill_retry_delay(),
            max_attempts: timings.kill_max_attempts.max(1),
        }
    }

    pub fn host(&self) -> &P {
        &self.host
    }

    pub async fn is_running(&self, name: &str) -> crate::Result<bool> {
        self.host.is_running(name).await
    }

    pub async fn stop(&self, name: &str) -> crate::Result<StopOutcome> {
        if !self.host.is_running(name).await? {
            debug!("{} is not running", name);
            return Ok(StopOutcome::NotRunning);
        }

        for attempt in 1..=self.max_attempts {
            let code = self.host.kill(name).await?;
            if code != 0 {
                debug!("Kill request {} for {} exited with {}", attempt, name, code);
            }
            let delay = if attempt == 1 {
                self.initial_delay
            } else {
                self.retry_delay
            };
            sleep(delay).await;

            if !self.host.is_running(name).await? {
                info!("Stopped {} after {} attempt(s)", name, attempt);
                return Ok(StopOutcome::Stopped { attempts: attempt });
            }
        }

        Err(SaveLoopError::TerminationFailed {
            process: name.to_string(),
            attempts: self.max_attempts,
        })
    }

    pub fn start(&self, command: &str) -> crate::Result<()> {
        self.host.spawn(command)?;
        info!("Started: {}", command);
        Ok(())
    }
}
