//! Remote command execution.
//!
//! [`Executor`] runs one shell command inside a container as a login shell
//! (`bash -lc`) under the session's service user.  The commands it is given
//! are silent on success, so any text on stderr counts as failure even when
//! the exit status is zero.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::backend::ContainerBackend;
use crate::errors::{GatewayError, GatewayResult};

pub struct Executor {
    backend: Arc<dyn ContainerBackend>,
    user: String,
    timeout: Duration,
}

impl Executor {
    pub fn new(backend: Arc<dyn ContainerBackend>, user: impl Into<String>, timeout: Duration) -> Self {
        Self {
            backend,
            user: user.into(),
            timeout,
        }
    }

    /// Run `command` inside `container` and return its stdout with trailing
    /// whitespace removed.
    pub async fn run(&self, container: &str, command: &str) -> GatewayResult<String> {
        debug!(container, user = %self.user, command, "remote exec");

        let argv = ["bash", "-lc", command];
        let exec = self.backend.exec(container, &self.user, &argv);
        let result = tokio::time::timeout(self.timeout, exec)
            .await
            .map_err(|_| GatewayError::Timeout {
                command: command.to_string(),
                secs: self.timeout.as_secs(),
            })??;

        let stderr = result.stderr_lossy();
        if !stderr.trim().is_empty() {
            return Err(GatewayError::ExecutionError(stderr.trim().to_string()));
        }
        if result.exit_code != 0 {
            return Err(GatewayError::ExecutionError(format!(
                "exit status {}: {command}",
                result.exit_code
            )));
        }
        Ok(result.stdout_lossy().trim_end().to_string())
    }
}
