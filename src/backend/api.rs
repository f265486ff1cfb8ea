//! Docker Engine API backend.
//!
//! [`DockerApi`] talks HTTP/1.1 to the Docker daemon over its unix socket
//! (or a plain tcp endpoint) and maps the primitives onto these endpoints:
//!
//! | Primitive  | Endpoint(s)                                                   |
//! |------------|---------------------------------------------------------------|
//! | exec       | `POST /containers/{id}/exec`, `POST /exec/{id}/start`, `GET /exec/{id}/json` |
//! | copy in    | `PUT /containers/{id}/archive?path=<dir>`                     |
//! | copy out   | `GET /containers/{id}/archive?path=<path>`                    |
//! | find       | `GET /containers/json?filters={"name":["^<name>$"]}`          |
//! | check      | `GET /_ping`                                                  |
//!
//! Each request opens a fresh connection; the daemon is local and exec
//! output is delivered as a close-delimited body.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode, header};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use super::{ContainerBackend, ExecResult};
use crate::errors::{GatewayError, GatewayResult};

/// Where the Docker daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    /// Parse a `DOCKER_HOST`-style address.
    ///
    /// Accepted formats:
    ///   - `unix:///var/run/docker.sock`
    ///   - `tcp://127.0.0.1:2375` (also `http://…`)
    pub fn parse(host: &str) -> GatewayResult<Self> {
        if let Some(path) = host.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(GatewayError::Config("docker host: empty socket path".into()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = host
            .strip_prefix("tcp://")
            .or_else(|| host.strip_prefix("http://"))
        {
            let addr = addr.trim_end_matches('/');
            if addr.is_empty() {
                return Err(GatewayError::Config("docker host: empty tcp address".into()));
            }
            return Ok(Endpoint::Tcp(addr.to_string()));
        }
        Err(GatewayError::Config(format!(
            "cannot parse docker host '{host}': use unix://<path> or tcp://<host>:<port>"
        )))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct IdResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct ExecInspect {
    #[serde(rename = "ExitCode")]
    exit_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ErrorMessage {
    message: String,
}

/// A buffered HTTP response.
struct Reply {
    status: StatusCode,
    body: Bytes,
}

impl Reply {
    /// The daemon's error message, falling back to the raw body.
    fn message(&self) -> String {
        serde_json::from_slice::<ErrorMessage>(&self.body)
            .map(|m| m.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&self.body).trim().to_string())
    }
}

// ---------------------------------------------------------------------------
// DockerApi
// ---------------------------------------------------------------------------

/// A backend that speaks the Docker Engine HTTP API.
pub struct DockerApi {
    endpoint: Endpoint,
}

impl DockerApi {
    pub fn new(host: &str) -> GatewayResult<Self> {
        Ok(Self {
            endpoint: Endpoint::parse(host)?,
        })
    }

    async fn request(
        &self,
        method: Method,
        uri: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> GatewayResult<Reply> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, "docker");
        if let Some(ct) = content_type {
            builder = builder.header(header::CONTENT_TYPE, ct);
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| GatewayError::Internal(format!("invalid request {uri}: {e}")))?;

        tracing::trace!(endpoint = %self.endpoint, %uri, "docker api request");
        match &self.endpoint {
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(|e| {
                    GatewayError::ExecutionError(format!("cannot connect to {}: {e}", self.endpoint))
                })?;
                send(stream, request).await
            }
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await.map_err(|e| {
                    GatewayError::ExecutionError(format!("cannot connect to {}: {e}", self.endpoint))
                })?;
                send(stream, request).await
            }
        }
    }

    async fn json_request(&self, method: Method, uri: &str, body: serde_json::Value) -> GatewayResult<Reply> {
        let body = Bytes::from(body.to_string());
        self.request(method, uri, Some("application/json"), body).await
    }
}

/// Run one request over a freshly connected stream.
async fn send<S>(stream: S, request: Request<Full<Bytes>>) -> GatewayResult<Reply>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| GatewayError::ExecutionError(format!("docker api handshake failed: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("docker api connection closed with error: {e}");
        }
    });

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| GatewayError::ExecutionError(format!("docker api request failed: {e}")))?;
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| GatewayError::ExecutionError(format!("docker api body read failed: {e}")))?
        .to_bytes();
    Ok(Reply { status, body })
}

/// Split Docker's multiplexed exec stream into stdout and stderr.
///
/// Each frame is an 8-byte header (`[stream, 0, 0, 0, len_be32]`) followed
/// by `len` payload bytes.  Stream 2 is stderr; 0 and 1 go to stdout.  A
/// body that does not start with a valid header is raw TTY output.
pub fn demux(raw: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    let looks_framed = raw.len() >= 8 && raw[0] <= 2 && raw[1..4] == [0, 0, 0];
    if !looks_framed {
        stdout.extend_from_slice(raw);
        return (stdout, stderr);
    }

    let mut rest = raw;
    while rest.len() >= 8 {
        let stream = rest[0];
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = (8 + len).min(rest.len());
        let payload = &rest[8..end];
        if stream == 2 {
            stderr.extend_from_slice(payload);
        } else {
            stdout.extend_from_slice(payload);
        }
        rest = &rest[end..];
    }
    (stdout, stderr)
}

fn archive_uri(container: &str, path: &str) -> String {
    format!(
        "/containers/{container}/archive?path={}",
        urlencoding::encode(path)
    )
}

#[async_trait]
impl ContainerBackend for DockerApi {
    async fn exec(&self, container: &str, user: &str, argv: &[&str]) -> GatewayResult<ExecResult> {
        let create = self
            .json_request(
                Method::POST,
                &format!("/containers/{container}/exec"),
                serde_json::json!({
                    "AttachStdin": false,
                    "AttachStdout": true,
                    "AttachStderr": true,
                    "Tty": false,
                    "User": user,
                    "Cmd": argv,
                }),
            )
            .await?;
        if create.status == StatusCode::NOT_FOUND {
            return Err(GatewayError::ContainerNotFound(container.to_string()));
        }
        if !create.status.is_success() {
            return Err(GatewayError::ExecutionError(format!(
                "exec create failed ({}): {}",
                create.status,
                create.message()
            )));
        }
        let exec: IdResponse = serde_json::from_slice(&create.body)
            .map_err(|e| GatewayError::ExecutionError(format!("bad exec create reply: {e}")))?;

        let start = self
            .json_request(
                Method::POST,
                &format!("/exec/{}/start", exec.id),
                serde_json::json!({ "Detach": false, "Tty": false }),
            )
            .await?;
        if !start.status.is_success() {
            return Err(GatewayError::ExecutionError(format!(
                "exec start failed ({}): {}",
                start.status,
                start.message()
            )));
        }
        let (stdout, stderr) = demux(&start.body);

        let inspect = self
            .request(Method::GET, &format!("/exec/{}/json", exec.id), None, Bytes::new())
            .await?;
        let exit_code = serde_json::from_slice::<ExecInspect>(&inspect.body)
            .ok()
            .and_then(|i| i.exit_code)
            .unwrap_or(-1);

        Ok(ExecResult {
            stdout: Bytes::from(stdout),
            stderr: Bytes::from(stderr),
            exit_code,
        })
    }

    async fn copy_to(
        &self,
        container: &str,
        remote_dir: &str,
        archive: Bytes,
    ) -> GatewayResult<()> {
        let reply = self
            .request(
                Method::PUT,
                &archive_uri(container, remote_dir),
                Some("application/x-tar"),
                archive,
            )
            .await
            .map_err(|e| GatewayError::TransferError(e.to_string()))?;
        match reply.status {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(GatewayError::NotFound(remote_dir.to_string())),
            StatusCode::FORBIDDEN => Err(GatewayError::PermissionDenied(remote_dir.to_string())),
            _ => Err(GatewayError::from_transfer(remote_dir, reply.message())),
        }
    }

    async fn copy_from(&self, container: &str, remote_path: &str) -> GatewayResult<Bytes> {
        let reply = self
            .request(Method::GET, &archive_uri(container, remote_path), None, Bytes::new())
            .await
            .map_err(|e| GatewayError::TransferError(e.to_string()))?;
        match reply.status {
            s if s.is_success() => Ok(reply.body),
            StatusCode::NOT_FOUND => Err(GatewayError::NotFound(remote_path.to_string())),
            _ => Err(GatewayError::from_transfer(remote_path, reply.message())),
        }
    }

    async fn find(&self, name: &str) -> GatewayResult<Option<String>> {
        let filters = serde_json::json!({ "name": [super::exact_name_pattern(name)] }).to_string();
        let uri = format!("/containers/json?filters={}", urlencoding::encode(&filters));
        let reply = self.request(Method::GET, &uri, None, Bytes::new()).await?;
        if !reply.status.is_success() {
            return Err(GatewayError::ExecutionError(format!(
                "container list failed ({}): {}",
                reply.status,
                reply.message()
            )));
        }
        let containers: Vec<IdResponse> = serde_json::from_slice(&reply.body)
            .map_err(|e| GatewayError::ExecutionError(format!("bad container list: {e}")))?;
        Ok(containers.into_iter().next().map(|c| c.id))
    }

    async fn check(&self) -> GatewayResult<()> {
        let reply = self.request(Method::GET, "/_ping", None, Bytes::new()).await?;
        if reply.status.is_success() {
            Ok(())
        } else {
            Err(GatewayError::ExecutionError(format!(
                "docker daemon ping failed ({})",
                reply.status
            )))
        }
    }

    fn description(&self) -> String {
        format!("api:{}", self.endpoint)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
