//! Process configuration.
//!
//! Values come from command-line flags (or their environment variables),
//! then from the `[gateway]` table of an optional TOML file, then from the
//! built-in defaults, in that order of precedence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::backend::BackendKind;
use crate::errors::{GatewayError, GatewayResult};
use crate::logging::LogFormat;
use crate::router::RouterOptions;

pub const DEFAULT_DOCKER_BIN: &str = "docker";
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";
pub const DEFAULT_DOCKER_USER: &str = "docker";
pub const DEFAULT_COMMAND_TIMEOUT: u64 = 30;
pub const DEFAULT_CONTAINER_CACHE_TTL: u64 = 300;

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct GlobalArgs {
    /// TOML configuration file with a `[gateway]` table.
    #[arg(long, value_name = "FILE", env = "SSH2DOCKER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Container runtime client: `cli` (docker binary) or `api` (Engine API).
    #[arg(long, env = "SSH2DOCKER_BACKEND", global = true)]
    pub backend: Option<BackendKind>,

    /// Docker client binary used by the `cli` backend.
    #[arg(long, value_name = "PATH", env = "SSH2DOCKER_DOCKER_BIN", global = true)]
    pub docker_bin: Option<String>,

    /// Docker daemon address used by the `api` backend.
    #[arg(long, value_name = "URL", env = "DOCKER_HOST", global = true)]
    pub docker_host: Option<String>,

    /// User that commands run as in `cli` service containers.
    #[arg(long, value_name = "USER", env = "SSH2DOCKER_DOCKER_USER", global = true)]
    pub docker_user: Option<String>,

    /// Upper bound in seconds for one remote command or copy.
    #[arg(long, value_name = "SECS", env = "SSH2DOCKER_COMMAND_TIMEOUT", global = true)]
    pub command_timeout: Option<u64>,

    /// Seconds a username → container lookup stays cached.
    #[arg(long, value_name = "SECS", env = "SSH2DOCKER_CONTAINER_CACHE_TTL", global = true)]
    pub container_cache_ttl: Option<u64>,

    /// Log at debug level when `RUST_LOG` is unset.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format [default: plain].
    #[arg(long, value_enum, env = "SSH2DOCKER_LOG_FORMAT", global = true)]
    pub log_format: Option<LogFormat>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    gateway: GatewaySection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct GatewaySection {
    backend: Option<BackendKind>,
    docker_bin: Option<String>,
    docker_host: Option<String>,
    docker_user: Option<String>,
    command_timeout: Option<u64>,
    container_cache_ttl: Option<u64>,
    verbose: Option<bool>,
    log_format: Option<LogFormat>,
}

impl FileConfig {
    fn load_from(path: &Path) -> GatewayResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("read {}: {e}", path.display())))?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> GatewayResult<Self> {
        toml::from_str(content)
            .map_err(|e| GatewayError::Config(format!("parse {}: {e}", path.display())))
    }
}

/// Resolved settings for one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub backend: BackendKind,
    pub docker_bin: String,
    pub docker_host: String,
    pub docker_user: String,
    pub command_timeout: Duration,
    pub container_cache_ttl: Duration,
    pub verbose: bool,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            docker_bin: DEFAULT_DOCKER_BIN.into(),
            docker_host: DEFAULT_DOCKER_HOST.into(),
            docker_user: DEFAULT_DOCKER_USER.into(),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT),
            container_cache_ttl: Duration::from_secs(DEFAULT_CONTAINER_CACHE_TTL),
            verbose: false,
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Build the configuration from flags and the file they point at.
    pub fn load(args: &GlobalArgs) -> GatewayResult<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load_from(path)?,
            None => FileConfig::default(),
        };
        Self::merge(args, file.gateway)
    }

    fn merge(args: &GlobalArgs, file: GatewaySection) -> GatewayResult<Self> {
        let command_timeout = args
            .command_timeout
            .or(file.command_timeout)
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        if command_timeout == 0 {
            return Err(GatewayError::Config(
                "command timeout must be at least one second".into(),
            ));
        }
        let docker_user = args
            .docker_user
            .clone()
            .or(file.docker_user)
            .unwrap_or_else(|| DEFAULT_DOCKER_USER.into());
        if docker_user.is_empty() {
            return Err(GatewayError::Config("docker user must not be empty".into()));
        }

        Ok(Self {
            backend: args.backend.or(file.backend).unwrap_or_default(),
            docker_bin: args
                .docker_bin
                .clone()
                .or(file.docker_bin)
                .unwrap_or_else(|| DEFAULT_DOCKER_BIN.into()),
            docker_host: args
                .docker_host
                .clone()
                .or(file.docker_host)
                .unwrap_or_else(|| DEFAULT_DOCKER_HOST.into()),
            docker_user,
            command_timeout: Duration::from_secs(command_timeout),
            container_cache_ttl: Duration::from_secs(
                args.container_cache_ttl
                    .or(file.container_cache_ttl)
                    .unwrap_or(DEFAULT_CONTAINER_CACHE_TTL),
            ),
            verbose: args.verbose || file.verbose.unwrap_or(false),
            log_format: args.log_format.or(file.log_format).unwrap_or_default(),
        })
    }

    pub fn router_options(&self) -> RouterOptions {
        RouterOptions {
            service_user: self.docker_user.clone(),
            command_timeout: self.command_timeout,
            cache_ttl: self.container_cache_ttl,
        }
    }
}
