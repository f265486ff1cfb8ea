//! Seam between the Docker CLI backend and the `docker` processes it starts.

use async_trait::async_trait;
use bytes::Bytes;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;

use super::ExecResult;
use crate::errors::{GatewayError, GatewayResult};

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` to completion.  With `stdin` the bytes are fed to the
    /// child and its input is closed afterwards; without it the child reads
    /// from `/dev/null`.
    async fn run(&self, program: &str, args: &[&str], stdin: Option<&[u8]>) -> GatewayResult<ExecResult>;
}

/// Spawns programs on this host.  A child whose future is dropped is killed.
pub struct LocalRunner;

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, program: &str, args: &[&str], stdin: Option<&[u8]>) -> GatewayResult<ExecResult> {
        let spawn_failed =
            |e: std::io::Error| GatewayError::ExecutionError(format!("cannot run {program}: {e}"));
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_failed)?;

        let pipe = child.stdin.take();
        let feed = async move {
            if let (Some(mut pipe), Some(data)) = (pipe, stdin) {
                pipe.write_all(data).await?;
                pipe.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        // Feed and drain together so a chatty child cannot stall on a full pipe.
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(spawn_failed)?;
        fed.map_err(|e| GatewayError::ExecutionError(format!("{program} stdin: {e}")))?;

        Ok(ExecResult {
            stdout: Bytes::from(output.stdout),
            stderr: Bytes::from(output.stderr),
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
        })
    }
}
