//! ssh2docker: a gateway that maps SSH usernames to running containers and
//! serves SFTP against a filesystem synthesized from shell commands and
//! tar copies inside the container.
//!
//! The pieces, leaf first:
//!
//! - [`backend`]: the container runtime client (docker CLI or Engine API)
//! - [`executor`]: runs one shell command in a container
//! - [`archive`]: tar-based whole-file upload and download
//! - [`vfs`]: the per-session cached tree of remote entries
//! - [`sftp`]: protocol request handlers over a tree
//! - [`router`]: username → container resolution and session wiring

pub mod archive;
pub mod backend;
pub mod config;
pub mod errors;
pub mod executor;
pub mod logging;
pub mod router;
pub mod sftp;
pub mod shell;
pub mod vfs;

pub use errors::{GatewayError, GatewayResult};
