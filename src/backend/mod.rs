//! Container backend trait and variants.
//!
//! A container only exposes two I/O primitives: running a process inside it
//! and copying tar archives in and out of it.  Each way of talking to the
//! container runtime implements the [`ContainerBackend`] trait, which the
//! executor and archive layers delegate to.
//!
//! Two variants exist, selected once at process start by [`BackendKind`]:
//!
//! - [`cli::DockerCli`] shells out to the `docker` binary.
//! - [`api::DockerApi`] speaks the Docker Engine HTTP API directly.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::errors::{GatewayError, GatewayResult};

pub mod api;
pub mod cli;
pub mod runner;
#[cfg(test)]
pub mod testing;

// ---------------------------------------------------------------------------
// Types returned by backend operations
// ---------------------------------------------------------------------------

/// Result of running a process inside a container via [`ContainerBackend::exec`].
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub exit_code: i64,
}

impl ExecResult {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Which container runtime client to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// `docker` command-line subprocesses.
    #[default]
    Cli,
    /// Docker Engine HTTP API.
    Api,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cli => write!(f, "cli"),
            BackendKind::Api => write!(f, "api"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cli" => Ok(BackendKind::Cli),
            "api" | "client" => Ok(BackendKind::Api),
            other => Err(GatewayError::Config(format!("unknown backend '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// A container runtime client capable of process execution, archive copy
/// and container lookup.
///
/// One instance is built at process start and shared by every session as
/// an `Arc<dyn ContainerBackend>`.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Run `argv` inside `container` as `user` and collect its output.
    async fn exec(&self, container: &str, user: &str, argv: &[&str]) -> GatewayResult<ExecResult>;

    /// Extract the tar stream `archive` into the directory `remote_dir`
    /// inside `container`.
    async fn copy_to(&self, container: &str, remote_dir: &str, archive: Bytes)
    -> GatewayResult<()>;

    /// Fetch a tar stream holding `remote_path` from `container`.
    async fn copy_from(&self, container: &str, remote_path: &str) -> GatewayResult<Bytes>;

    /// Resolve a running container by exact name.  `Ok(None)` when no
    /// running container carries that name.
    async fn find(&self, name: &str) -> GatewayResult<Option<String>>;

    /// Check whether the container runtime is reachable.
    async fn check(&self) -> GatewayResult<()>;

    /// A human-readable description of this backend, used in logs.
    fn description(&self) -> String;
}

/// Anchored pattern for Docker's `name` filter, which is a regular
/// expression.  Metacharacters in `name` match only themselves.
pub fn exact_name_pattern(name: &str) -> String {
    let mut pattern = String::with_capacity(name.len() + 2);
    pattern.push('^');
    for c in name.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('$');
    pattern
}

/// Build the backend selected by `kind`.
pub fn build(
    kind: BackendKind,
    docker_bin: &str,
    docker_host: &str,
) -> GatewayResult<Arc<dyn ContainerBackend>> {
    match kind {
        BackendKind::Cli => Ok(Arc::new(cli::DockerCli::new(
            Arc::new(runner::LocalRunner),
            docker_bin,
        ))),
        BackendKind::Api => Ok(Arc::new(api::DockerApi::new(docker_host)?)),
    }
}
