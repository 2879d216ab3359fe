// src/core/gateway.rs

//! Executes one external shell command at a time with a timeout.
//!
//! The single-flight slot is a hard gate, not a queue: a second request while
//! a command is in flight is rejected immediately with `CommandRefused`.

use crate::core::RelayError;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// RAII guard over the single-flight slot. The slot is released exactly when
/// the in-flight execution finishes, fails, or times out — or when the
/// execution future is abandoned, which would otherwise wedge the gateway.
struct SlotGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

pub struct CommandGateway {
    shell: String,
    /// The shell's argument template, tokenized on whitespace. The `{0}`
    /// token is replaced with the raw command string so it reaches the shell
    /// as a single argument.
    template: Vec<String>,
    busy: Arc<AtomicBool>,
}

impl CommandGateway {
    pub fn new(shell: impl Into<String>, template: &str) -> Self {
        Self {
            shell: shell.into(),
            template: template.split_whitespace().map(String::from).collect(),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Tries to claim the single-flight slot. On acceptance returns the
    /// execution future, which resolves with the combined stdout/stderr of
    /// the command, `TimedOut` after killing a command that outlives its
    /// deadline, or `CommandFailed` on spawn failure or nonzero exit. The
    /// check-and-acquire is a single compare-exchange, so exactly one of two
    /// concurrent callers wins.
    pub fn try_start_executing(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<BoxFuture<'static, Result<String, RelayError>>, RelayError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RelayError::CommandRefused);
        }
        let guard = SlotGuard {
            busy: self.busy.clone(),
        };

        let shell = self.shell.clone();
        let args: Vec<String> = self
            .template
            .iter()
            .map(|token| {
                if token == "{0}" {
                    command.to_string()
                } else {
                    token.clone()
                }
            })
            .collect();

        debug!("gateway accepted command: {shell} {args:?}");
        Ok(async move {
            let _guard = guard;
            run_command(&shell, &args, timeout).await
        }
        .boxed())
    }
}

async fn run_command(shell: &str, args: &[String], timeout: Duration) -> Result<String, RelayError> {
    let mut child = Command::new(shell)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RelayError::CommandFailed(format!("failed to spawn '{shell}': {e}")))?;

    // Drain both pipes concurrently with waiting, so a chatty command cannot
    // deadlock on a full pipe buffer.
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| RelayError::Internal("child stdout was not captured".into()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| RelayError::Internal("child stderr was not captured".into()))?;
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    let status = tokio::select! {
        status = child.wait() => {
            status.map_err(|e| RelayError::CommandFailed(format!("failed to await command: {e}")))?
        }
        _ = tokio::time::sleep(timeout) => {
            if let Err(e) = child.kill().await {
                warn!("failed to kill timed-out command: {e}");
            }
            return Err(RelayError::TimedOut);
        }
    };

    let mut output = stdout_task.await.unwrap_or_default();
    output.extend(stderr_task.await.unwrap_or_default());
    let output = String::from_utf8_lossy(&output).into_owned();

    if status.success() {
        Ok(output)
    } else {
        Err(RelayError::CommandFailed(format!(
            "command exited with {status}: {}",
            output.trim()
        )))
    }
}
