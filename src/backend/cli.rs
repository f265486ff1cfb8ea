//! Docker CLI backend.
//!
//! [`DockerCli`] implements [`ContainerBackend`] by spawning the `docker`
//! binary for every primitive:
//!
//! - **exec**: `docker exec -u <user> <container> <argv…>`
//! - **copy in**: `docker cp - <container>:<dir>` with the tar stream on stdin
//! - **copy out**: `docker cp <container>:<path> -` with the tar stream on stdout
//! - **find**: `docker ps --filter name=^<name>$ --quiet --no-trunc`
//!
//! The processes are spawned through a [`CommandRunner`], so tests can
//! observe the exact argument vectors without a Docker daemon.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use super::runner::CommandRunner;
use super::{ContainerBackend, ExecResult};
use crate::errors::{GatewayError, GatewayResult};

/// A backend that drives the local `docker` command-line client.
pub struct DockerCli {
    runner: Arc<dyn CommandRunner>,
    /// Program name or path of the docker client.
    docker_bin: String,
}

impl DockerCli {
    pub fn new(runner: Arc<dyn CommandRunner>, docker_bin: &str) -> Self {
        Self {
            runner,
            docker_bin: docker_bin.into(),
        }
    }

    fn exec_args<'a>(container: &'a str, user: &'a str, argv: &[&'a str]) -> Vec<&'a str> {
        let mut args = vec!["exec", "-u", user, container];
        args.extend_from_slice(argv);
        args
    }

    /// Turn a failed `docker cp` into a typed error.
    fn check_copy(result: &ExecResult, path: &str) -> GatewayResult<()> {
        if result.exit_code == 0 {
            return Ok(());
        }
        let stderr = result.stderr_lossy();
        let msg = stderr.trim();
        if msg.is_empty() {
            Err(GatewayError::TransferError(format!(
                "docker cp exited with code {} for path: {path}",
                result.exit_code
            )))
        } else {
            Err(GatewayError::from_transfer(path, msg))
        }
    }
}

#[async_trait]
impl ContainerBackend for DockerCli {
    async fn exec(&self, container: &str, user: &str, argv: &[&str]) -> GatewayResult<ExecResult> {
        let args = Self::exec_args(container, user, argv);
        self.runner.run(&self.docker_bin, &args, None).await
    }

    async fn copy_to(
        &self,
        container: &str,
        remote_dir: &str,
        archive: Bytes,
    ) -> GatewayResult<()> {
        let dest = format!("{container}:{remote_dir}");
        let result = self
            .runner
            .run(&self.docker_bin, &["cp", "-", &dest], Some(&archive))
            .await
            .map_err(|e| GatewayError::TransferError(e.to_string()))?;
        Self::check_copy(&result, remote_dir)
    }

    async fn copy_from(&self, container: &str, remote_path: &str) -> GatewayResult<Bytes> {
        let src = format!("{container}:{remote_path}");
        let result = self
            .runner
            .run(&self.docker_bin, &["cp", &src, "-"], None)
            .await
            .map_err(|e| GatewayError::TransferError(e.to_string()))?;
        Self::check_copy(&result, remote_path)?;
        Ok(result.stdout)
    }

    async fn find(&self, name: &str) -> GatewayResult<Option<String>> {
        let filter = format!("name={}", super::exact_name_pattern(name));
        let result = self
            .runner
            .run(
                &self.docker_bin,
                &["ps", "--filter", &filter, "--quiet", "--no-trunc"],
                None,
            )
            .await?;
        if result.exit_code != 0 {
            return Err(GatewayError::ExecutionError(format!(
                "docker ps failed: {}",
                result.stderr_lossy().trim()
            )));
        }
        Ok(result
            .stdout_lossy()
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(String::from))
    }

    async fn check(&self) -> GatewayResult<()> {
        let result = self
            .runner
            .run(&self.docker_bin, &["version", "--format", "{{.Server.Version}}"], None)
            .await?;
        if result.exit_code == 0 {
            Ok(())
        } else {
            Err(GatewayError::ExecutionError(format!(
                "docker daemon unreachable: {}",
                result.stderr_lossy().trim()
            )))
        }
    }

    fn description(&self) -> String {
        format!("cli:{}", self.docker_bin)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
