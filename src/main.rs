//! ssh2docker: operator front end for the container filesystem gateway.
//!
//! Every command resolves a username to its container the way an SSH login
//! would, opens one file-transfer session, issues protocol requests through
//! the adapter and closes the session again.
//!
//! # Exit codes
//!
//! - 0: success
//! - 1: the file operation failed
//! - 2: setup failure (configuration, backend, container lookup)

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing::error;

use ssh2docker::GatewayResult;
use ssh2docker::backend;
use ssh2docker::config::{Config, GlobalArgs};
use ssh2docker::errors::GatewayError;
use ssh2docker::logging;
use ssh2docker::router::{Router, Session};
use ssh2docker::sftp::{Method, Request, StatusCode};

/// Chunk size for reads and writes through the adapter, the usual SFTP
/// packet payload.
const CHUNK: usize = 32 * 1024;

/// Entries requested per listing page.
const PAGE: usize = 100;

#[derive(Debug, Parser)]
#[command(name = "ssh2docker", version, about, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show which container a username maps to.
    Find { user: String },
    /// List a directory.
    Ls {
        user: String,
        #[arg(default_value = "/")]
        path: String,
    },
    /// Show one entry.
    Stat { user: String, path: String },
    /// Show where a symlink points.
    Readlink { user: String, path: String },
    /// Download a file to LOCAL, or to stdout.
    Get {
        user: String,
        remote: String,
        local: Option<PathBuf>,
    },
    /// Upload a local file.
    Put {
        user: String,
        local: PathBuf,
        remote: String,
    },
    /// Create an empty file.
    Touch { user: String, path: String },
    /// Create a directory and its parents.
    Mkdir { user: String, path: String },
    /// Remove a file.
    Rm { user: String, path: String },
    /// Remove a directory tree.
    Rmdir { user: String, path: String },
    /// Rename or move an entry.
    Mv { user: String, src: String, dst: String },
    /// Change permission bits (octal MODE).
    Chmod {
        user: String,
        #[arg(value_parser = parse_octal)]
        mode: u32,
        path: String,
    },
    /// Set a file's size.
    Truncate { user: String, size: u64, path: String },
}

impl Command {
    fn user(&self) -> &str {
        match self {
            Command::Find { user }
            | Command::Ls { user, .. }
            | Command::Stat { user, .. }
            | Command::Readlink { user, .. }
            | Command::Get { user, .. }
            | Command::Put { user, .. }
            | Command::Touch { user, .. }
            | Command::Mkdir { user, .. }
            | Command::Rm { user, .. }
            | Command::Rmdir { user, .. }
            | Command::Mv { user, .. }
            | Command::Chmod { user, .. }
            | Command::Truncate { user, .. } => user,
        }
    }
}

fn parse_octal(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s, 8).map_err(|e| format!("invalid octal mode '{s}': {e}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.global) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ssh2docker: {e}");
            return ExitCode::from(2);
        }
    };
    if let Err(e) = logging::init(config.verbose, config.log_format) {
        eprintln!("ssh2docker: {e}");
        return ExitCode::from(2);
    }

    let router = match setup(&config).await {
        Ok(router) => router,
        Err(e) => {
            error!(error = %e, "setup failed");
            eprintln!("ssh2docker: {e}");
            return ExitCode::from(2);
        }
    };

    if let Command::Find { user } = &cli.command {
        return match router.resolve(user).await {
            Ok((target, id)) => {
                println!("{}\t{}\t{}", target.container_name, id, target.user);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("ssh2docker: {e}");
                ExitCode::from(2)
            }
        };
    }

    let session = match router.open_session(cli.command.user()).await {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "session setup failed");
            eprintln!("ssh2docker: {e}");
            return ExitCode::from(2);
        }
    };

    tracing::debug!(
        container = %session.target().container_name,
        id = %session.container_id(),
        "running command"
    );
    let result = run(&session, cli.command).await;
    session.close().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ssh2docker: {e} ({})", StatusCode::from(&e));
            ExitCode::from(1)
        }
    }
}

async fn setup(config: &Config) -> GatewayResult<Router> {
    let backend = backend::build(config.backend, &config.docker_bin, &config.docker_host)?;
    backend.check().await?;
    tracing::debug!(backend = %backend.description(), "backend ready");
    Ok(Router::new(backend, config.router_options()))
}

async fn run(session: &Session, command: Command) -> GatewayResult<()> {
    let adapter = session.adapter();
    match command {
        Command::Find { .. } => Ok(()),
        Command::Ls { path, .. } => {
            let listing = adapter.file_list(&Request::new(Method::List, path)).await?;
            let mut offset = 0;
            loop {
                let (page, eof) = listing.list_at(offset, PAGE);
                for info in page {
                    println!("{}", info.long_name());
                }
                offset += page.len();
                if eof {
                    return Ok(());
                }
            }
        }
        Command::Stat { path, .. } => {
            let listing = adapter.file_list(&Request::new(Method::Stat, path)).await?;
            for info in listing.entries() {
                println!("{}", info.long_name());
                println!("  path:  {}", info.path);
                println!("  size:  {}", info.size);
                println!("  mode:  {:o}", info.mode);
                println!("  mtime: {}", info.mtime_secs());
            }
            Ok(())
        }
        Command::Readlink { path, .. } => {
            let listing = adapter
                .file_list(&Request::new(Method::Readlink, path))
                .await?;
            for info in listing.entries() {
                println!("{}", info.path);
            }
            Ok(())
        }
        Command::Get { remote, local, .. } => {
            let reader = adapter.file_read(&Request::new(Method::Get, remote)).await?;
            let mut out: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match &local {
                Some(path) => Box::new(tokio::fs::File::create(path).await?),
                None => Box::new(tokio::io::stdout()),
            };
            let mut buf = vec![0u8; CHUNK];
            let mut offset = 0u64;
            loop {
                let n = reader.read_at(&mut buf, offset);
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).await?;
                offset += n as u64;
            }
            out.flush().await?;
            Ok(())
        }
        Command::Put { local, remote, .. } => {
            let data = tokio::fs::read(&local).await.map_err(|e| {
                GatewayError::InvalidOperation(format!("read {}: {e}", local.display()))
            })?;
            let mut writer = adapter.file_write(&Request::new(Method::Put, remote)).await?;
            let mut offset = 0u64;
            for chunk in data.chunks(CHUNK) {
                offset += writer.write_at(chunk, offset)? as u64;
            }
            writer.close().await
        }
        Command::Touch { path, .. } => {
            let writer = adapter.file_write(&Request::new(Method::Put, path)).await?;
            writer.close().await
        }
        Command::Mkdir { path, .. } => adapter.file_cmd(&Request::new(Method::Mkdir, path)).await,
        Command::Rm { path, .. } => adapter.file_cmd(&Request::new(Method::Remove, path)).await,
        Command::Rmdir { path, .. } => adapter.file_cmd(&Request::new(Method::Rmdir, path)).await,
        Command::Mv { src, dst, .. } => {
            adapter
                .file_cmd(&Request::new(Method::Rename, src).with_target(dst))
                .await
        }
        Command::Chmod { mode, path, .. } => {
            adapter
                .file_cmd(&Request::new(Method::Setstat, path).with_mode(mode))
                .await
        }
        Command::Truncate { size, path, .. } => {
            adapter
                .file_cmd(&Request::new(Method::Setstat, path).with_size(size))
                .await
        }
    }
}
