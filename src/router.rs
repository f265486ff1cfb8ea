//! Session routing.
//!
//! Maps an authenticated username to a running container and wires a
//! [`VirtualTree`] plus [`Adapter`] for it.  Container lookups go through a
//! TTL cache shared by every session of the process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::archive::ArchiveTransfer;
use crate::backend::ContainerBackend;
use crate::errors::{GatewayError, GatewayResult};
use crate::executor::Executor;
use crate::sftp::Adapter;
use crate::vfs::VirtualTree;

/// Separator between project and service in a username.
const SERVICE_SEPARATOR: &str = "---";

/// Service used when the username names only a project.
const DEFAULT_SERVICE: &str = "cli";

/// Where a username points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub project: String,
    pub service: String,
    /// Compose-style container name, `<project>_<service>_1`.
    pub container_name: String,
    /// User commands run as inside the container.
    pub user: String,
}

impl Target {
    /// `project---service` selects a service; a bare `project` selects its
    /// `cli` service.  The `cli` service runs as `service_user`, anything
    /// else as root.
    pub fn from_username(username: &str, service_user: &str) -> GatewayResult<Self> {
        let (project, service) = username
            .split_once(SERVICE_SEPARATOR)
            .unwrap_or((username, DEFAULT_SERVICE));
        if project.is_empty() || service.is_empty() {
            return Err(GatewayError::ContainerNotFound(format!(
                "malformed username '{username}'"
            )));
        }
        let user = if service == DEFAULT_SERVICE {
            service_user
        } else {
            "root"
        };
        Ok(Self {
            project: project.to_string(),
            service: service.to_string(),
            container_name: format!("{project}_{service}_1"),
            user: user.to_string(),
        })
    }
}

struct CacheEntry<T> {
    value: T,
    inserted_at: Instant,
}

impl<T> CacheEntry<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() > ttl
    }
}

/// Settings the router needs from the process configuration.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub service_user: String,
    pub command_timeout: Duration,
    pub cache_ttl: Duration,
}

pub struct Router {
    backend: Arc<dyn ContainerBackend>,
    options: RouterOptions,
    containers: Mutex<HashMap<String, CacheEntry<String>>>,
}

impl Router {
    pub fn new(backend: Arc<dyn ContainerBackend>, options: RouterOptions) -> Self {
        Self {
            backend,
            options,
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `username` to its target and the id of the running container.
    pub async fn resolve(&self, username: &str) -> GatewayResult<(Target, String)> {
        let target = Target::from_username(username, &self.options.service_user)?;
        if let Some(id) = self.cached(&target.container_name) {
            debug!(name = %target.container_name, id = %id, "container cache hit");
            return Ok((target, id));
        }

        let id = self
            .backend
            .find(&target.container_name)
            .await?
            .ok_or_else(|| GatewayError::ContainerNotFound(target.container_name.clone()))?;
        if let Ok(mut cache) = self.containers.lock() {
            cache.insert(target.container_name.clone(), CacheEntry::new(id.clone()));
        }
        Ok((target, id))
    }

    fn cached(&self, name: &str) -> Option<String> {
        let mut cache = self.containers.lock().ok()?;
        cache.retain(|_, e| !e.is_expired(self.options.cache_ttl));
        cache.get(name).map(|e| e.value.clone())
    }

    /// Open a file-transfer session for `username`.
    pub async fn open_session(&self, username: &str) -> GatewayResult<Session> {
        let (target, container_id) = self.resolve(username).await?;
        let executor = Arc::new(Executor::new(
            self.backend.clone(),
            target.user.clone(),
            self.options.command_timeout,
        ));
        let archive = Arc::new(ArchiveTransfer::new(
            self.backend.clone(),
            self.options.command_timeout,
        ));
        let tree = Arc::new(VirtualTree::new(&container_id, executor, archive));
        info!(
            username,
            container = %target.container_name,
            id = %container_id,
            user = %target.user,
            "session opened"
        );
        Ok(Session {
            username: username.to_string(),
            target,
            adapter: Adapter::new(tree),
        })
    }
}

/// One file-transfer session bound to one container.
pub struct Session {
    username: String,
    target: Target,
    adapter: Adapter,
}

impl Session {
    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn container_id(&self) -> &str {
        self.adapter.tree().container_id()
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Drain outstanding removals and release the tree.  Unflushed writers
    /// are discarded when dropped.
    pub async fn close(self) {
        self.adapter.tree().close().await;
        info!(username = %self.username, container = %self.target.container_name, "session closed");
    }
}
