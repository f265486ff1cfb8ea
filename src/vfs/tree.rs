//! Per-session virtual tree.
//!
//! A [`VirtualTree`] maps absolute paths to [`RemoteEntry`] values for one
//! container.  Entries are fetched lazily with a probe command and never
//! re-validated; only mutations issued through the same tree change them.
//!
//! All state sits behind one async mutex that stays held across the remote
//! call of an operation, so a session never runs two container commands at
//! once.  Removals are the exception: the entry is marked deleted under the
//! lock and the `rm` runs on a spawned task.  Any later mutation touching
//! that path first waits for the task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::entry::{EntryKind, RemoteEntry, parse_listing_line};
use super::{is_within, join, normalize, parent_of};
use crate::archive::ArchiveTransfer;
use crate::errors::{GatewayError, GatewayResult};
use crate::executor::Executor;
use crate::shell;

/// Requested attribute changes for [`VirtualTree::setstat`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttrs {
    pub mode: Option<u32>,
    pub size: Option<u64>,
}

/// Largest file a single write handle buffers before upload.
pub const MAX_WRITE_SIZE: usize = 1 << 30;

/// An open write: bytes accumulate here and reach the container in one
/// upload when passed to [`VirtualTree::commit`].  Dropping the handle
/// discards the buffer.
#[derive(Debug)]
pub struct WriteHandle {
    path: String,
    buffer: Vec<u8>,
}

impl WriteHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Copy `data` into the buffer at `offset`, zero-filling any gap.  The
    /// buffer never grows past [`MAX_WRITE_SIZE`].
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> GatewayResult<usize> {
        let end = usize::try_from(offset)
            .ok()
            .and_then(|start| start.checked_add(data.len()))
            .filter(|&end| end <= MAX_WRITE_SIZE)
            .ok_or_else(|| {
                GatewayError::InvalidOperation(format!(
                    "write of {} bytes at offset {offset} exceeds {MAX_WRITE_SIZE} bytes: {}",
                    data.len(),
                    self.path
                ))
            })?;
        let start = end - data.len();
        if self.buffer.len() < end {
            self.buffer.resize(end, 0);
        }
        self.buffer[start..end].copy_from_slice(data);
        Ok(data.len())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

struct PendingDelete {
    path: String,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct TreeState {
    entries: HashMap<String, RemoteEntry>,
    pending_deletes: Vec<PendingDelete>,
}

impl TreeState {
    /// Whether `path` or one of its cached ancestors is marked deleted.
    fn is_deleted(&self, path: &str) -> bool {
        let mut current = path;
        loop {
            if self.entries.get(current).is_some_and(|e| e.deleted) {
                return true;
            }
            if current == "/" {
                return false;
            }
            current = parent_of(current);
        }
    }
}

pub struct VirtualTree {
    container_id: String,
    executor: Arc<Executor>,
    archive: Arc<ArchiveTransfer>,
    state: Mutex<TreeState>,
}

impl VirtualTree {
    pub fn new(container_id: &str, executor: Arc<Executor>, archive: Arc<ArchiveTransfer>) -> Self {
        let mut state = TreeState::default();
        state
            .entries
            .insert("/".to_string(), RemoteEntry::root(container_id));
        Self {
            container_id: container_id.to_string(),
            executor,
            archive,
            state: Mutex::new(state),
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    // -- Lookup --------------------------------------------------------------

    /// Resolve `path`, probing the container on a cache miss.
    pub async fn fetch(&self, path: &str) -> GatewayResult<RemoteEntry> {
        let path = normalize(path);
        let mut state = self.state.lock().await;
        self.fetch_locked(&mut state, &path).await
    }

    async fn fetch_locked(&self, state: &mut TreeState, path: &str) -> GatewayResult<RemoteEntry> {
        if let Some(entry) = state.entries.get(path)
            && !entry.deleted
        {
            return Ok(entry.clone());
        }
        if state.is_deleted(path) {
            return Err(GatewayError::NotFound(path.to_string()));
        }

        let output = self.remote(path, &shell::probe(path)).await?;
        let Some(line) = output.lines().find(|l| !l.trim().is_empty()) else {
            return Err(GatewayError::NotFound(path.to_string()));
        };
        let parsed = parse_listing_line(line).ok_or_else(|| {
            GatewayError::ExecutionError(format!("unparseable listing for {path}: {line}"))
        })?;

        let mut entry = RemoteEntry::from_listing(path, parsed, &self.container_id);
        entry.symlink_target = entry
            .symlink_target
            .take()
            .map(|target| resolve_link(path, &target));
        state.entries.insert(path.to_string(), entry.clone());
        Ok(entry)
    }

    /// Resolve `path` and follow a symlink by one hop.
    async fn follow_locked(&self, state: &mut TreeState, path: &str) -> GatewayResult<RemoteEntry> {
        let entry = self.fetch_locked(state, path).await?;
        match &entry.symlink_target {
            Some(target) => self.fetch_locked(state, target).await,
            None => Ok(entry),
        }
    }

    /// List a directory, registering every child in the cache.  Children are
    /// returned sorted by name.
    pub async fn list(&self, dir: &str) -> GatewayResult<Vec<RemoteEntry>> {
        let dir = normalize(dir);
        let mut state = self.state.lock().await;
        let target = self.follow_locked(&mut state, &dir).await?;
        if !target.is_dir() {
            return Err(GatewayError::InvalidOperation(format!(
                "not a directory: {dir}"
            )));
        }
        let dir = target.path;

        let output = self.remote(&dir, &shell::list(&dir)).await?;
        let mut children = Vec::new();
        for line in output.lines().skip(1) {
            let Some(parsed) = parse_listing_line(line) else {
                continue;
            };
            if parsed.name == "." || parsed.name == ".." {
                continue;
            }
            let path = join(&dir, &parsed.name);
            if state.is_deleted(&path) {
                continue;
            }

            let entry = match state.entries.get_mut(&path) {
                Some(cached) => {
                    if cached.content.is_none() {
                        cached.size_hint = parsed.size;
                    }
                    cached.clone()
                }
                None => {
                    let mut entry = RemoteEntry::from_listing(&path, parsed, &self.container_id);
                    entry.symlink_target = entry
                        .symlink_target
                        .take()
                        .map(|target| resolve_link(&path, &target));
                    state.entries.insert(path.clone(), entry.clone());
                    entry
                }
            };
            children.push(entry);
        }
        children.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(children)
    }

    /// The entry a symlink points at, or the entry itself for anything else.
    pub async fn readlink(&self, path: &str) -> GatewayResult<RemoteEntry> {
        let path = normalize(path);
        let mut state = self.state.lock().await;
        self.follow_locked(&mut state, &path).await
    }

    // -- Content -------------------------------------------------------------

    /// Download the whole file and cache it as the entry's content.
    pub async fn read(&self, path: &str) -> GatewayResult<Bytes> {
        let path = normalize(path);
        let mut state = self.state.lock().await;
        let entry = self.follow_locked(&mut state, &path).await?;
        if entry.is_dir() {
            return Err(GatewayError::InvalidOperation(format!(
                "is a directory: {path}"
            )));
        }

        let data = self.archive.download(&self.container_id, &entry.path).await?;
        if let Some(cached) = state.entries.get_mut(&entry.path) {
            cached.content = Some(data.clone());
        }
        Ok(data)
    }

    /// Start writing `path`.  A new file needs an existing parent directory.
    /// The cache is left alone until [`commit`](Self::commit) succeeds, so an
    /// abandoned or failed write leaves no trace.
    pub async fn open_write(&self, path: &str) -> GatewayResult<WriteHandle> {
        let path = normalize(path);
        let mut state = self.state.lock().await;

        let target = match self.follow_locked(&mut state, &path).await {
            Ok(entry) if entry.is_dir() => {
                return Err(GatewayError::InvalidOperation(format!(
                    "is a directory: {path}"
                )));
            }
            Ok(entry) => entry.path,
            Err(GatewayError::NotFound(_)) => {
                let parent = self.fetch_locked(&mut state, parent_of(&path)).await?;
                if !parent.is_dir() {
                    return Err(GatewayError::InvalidOperation(format!(
                        "parent is not a directory: {}",
                        parent.path
                    )));
                }
                path
            }
            Err(e) => return Err(e),
        };

        Ok(WriteHandle {
            path: target,
            buffer: Vec::new(),
        })
    }

    /// Push a finished write to the container: the whole buffer goes up as
    /// one archive, or an empty buffer becomes a plain `touch`.
    pub async fn commit(&self, handle: WriteHandle) -> GatewayResult<()> {
        let WriteHandle { path, buffer } = handle;
        let mut state = self.state.lock().await;
        settle(&mut state, &path).await;

        if buffer.is_empty() {
            self.remote(&path, &shell::touch(&path)).await?;
        } else {
            self.archive
                .upload_bytes(&self.container_id, &path, &buffer)
                .await?;
        }

        let size = buffer.len();
        // `touch` leaves an existing file's bytes in place.
        if buffer.is_empty()
            && let Some(existing) = state.entries.get_mut(&path)
            && !existing.deleted
        {
            existing.modified = SystemTime::now();
        } else {
            let entry = state
                .entries
                .entry(path.clone())
                .or_insert_with(|| RemoteEntry::new(&path, EntryKind::File, &self.container_id));
            entry.deleted = false;
            entry.modified = SystemTime::now();
            entry.size_hint = size.to_string();
            entry.content = Some(Bytes::from(buffer));
        }
        debug!(container = %self.container_id, path = %path, size, "write committed");
        Ok(())
    }

    // -- Structure -----------------------------------------------------------

    /// Apply permission and/or size changes.  The cached entry is dropped
    /// afterwards so the next lookup re-probes the real size.
    pub async fn setstat(&self, path: &str, attrs: SetAttrs) -> GatewayResult<()> {
        let path = normalize(path);
        let mut state = self.state.lock().await;
        self.fetch_locked(&mut state, &path).await?;
        settle(&mut state, &path).await;

        if let Some(mode) = attrs.mode {
            self.remote(&path, &shell::chmod(mode, &path)).await?;
        }
        if let Some(size) = attrs.size {
            self.remote(&path, &shell::truncate(size, &path)).await?;
        }
        if path != "/" {
            state.entries.remove(&path);
        }
        Ok(())
    }

    /// Move `from` to exactly `to` and re-key every cached entry under
    /// `from`.  A file never replaces a directory.
    pub async fn rename(&self, from: &str, to: &str) -> GatewayResult<()> {
        let (from, to) = (normalize(from), normalize(to));
        if from == "/" || to == "/" {
            return Err(GatewayError::InvalidOperation("cannot rename /".into()));
        }
        let mut state = self.state.lock().await;
        let source = self.fetch_locked(&mut state, &from).await?;
        match self.fetch_locked(&mut state, &to).await {
            Ok(dest) if dest.is_dir() && !source.is_dir() => {
                return Err(GatewayError::InvalidOperation(format!(
                    "is a directory: {to}"
                )));
            }
            Ok(_) | Err(GatewayError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        settle(&mut state, &from).await;
        settle(&mut state, &to).await;

        self.remote(&from, &shell::rename(&from, &to)).await?;

        state.entries.retain(|k, _| !is_within(k, &to));
        let moved: Vec<String> = state
            .entries
            .keys()
            .filter(|k| is_within(k, &from))
            .cloned()
            .collect();
        for old in moved {
            if let Some(mut entry) = state.entries.remove(&old) {
                let new = format!("{to}{}", &old[from.len()..]);
                entry.path = new.clone();
                state.entries.insert(new, entry);
            }
        }
        Ok(())
    }

    /// Mark `path` (and everything cached under it) deleted and start the
    /// remote removal without waiting for it.
    pub async fn remove(&self, path: &str) -> GatewayResult<()> {
        let path = normalize(path);
        if path == "/" {
            return Err(GatewayError::InvalidOperation("cannot remove /".into()));
        }
        let mut state = self.state.lock().await;
        let entry = self.fetch_locked(&mut state, &path).await?;

        for (key, cached) in state.entries.iter_mut() {
            if is_within(key, &path) {
                cached.deleted = true;
                cached.content = None;
            }
        }

        state.pending_deletes.retain(|p| !p.task.is_finished());
        let executor = self.executor.clone();
        let container = self.container_id.clone();
        let command = shell::remove(&path, entry.is_dir());
        let target = path.clone();
        let task = tokio::spawn(async move {
            match executor.run(&container, &command).await {
                Ok(_) => debug!(container = %container, path = %target, "remote delete finished"),
                Err(e) => warn!(container = %container, path = %target, error = %e, "remote delete failed"),
            }
        });
        state.pending_deletes.push(PendingDelete { path, task });
        Ok(())
    }

    /// Create a directory (and missing parents).  An existing directory is
    /// left untouched.
    pub async fn mkdir(&self, path: &str) -> GatewayResult<()> {
        let path = normalize(path);
        let mut state = self.state.lock().await;
        match self.fetch_locked(&mut state, &path).await {
            Ok(entry) if entry.is_dir() => return Ok(()),
            Ok(_) => {
                return Err(GatewayError::InvalidOperation(format!(
                    "file exists: {path}"
                )));
            }
            Err(GatewayError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        settle(&mut state, &path).await;

        self.remote(&path, &shell::mkdir(&path)).await?;

        state.entries.insert(
            path.clone(),
            RemoteEntry::new(&path, EntryKind::Dir, &self.container_id),
        );
        // `mkdir -p` also brought back any ancestor removed in this session.
        let mut current = parent_of(&path);
        while current != "/" {
            if state.entries.get(current).is_some_and(|e| e.deleted) {
                state.entries.insert(
                    current.to_string(),
                    RemoteEntry::new(current, EntryKind::Dir, &self.container_id),
                );
            }
            current = parent_of(current);
        }
        Ok(())
    }

    /// Wait for outstanding removals and drop every cached entry.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        let pending = std::mem::take(&mut state.pending_deletes);
        for delete in pending {
            if let Err(e) = delete.task.await {
                warn!(path = %delete.path, error = %e, "remote delete task failed");
            }
        }
        state.entries.clear();
        state
            .entries
            .insert("/".to_string(), RemoteEntry::root(&self.container_id));
        debug!(container = %self.container_id, "tree closed");
    }

    async fn remote(&self, path: &str, command: &str) -> GatewayResult<String> {
        self.executor
            .run(&self.container_id, command)
            .await
            .map_err(|e| e.about(path))
    }
}

/// Wait for removals that overlap `path`, in either direction.
async fn settle(state: &mut TreeState, path: &str) {
    let (overlapping, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending_deletes)
        .into_iter()
        .partition(|p| is_within(path, &p.path) || is_within(&p.path, path));
    state.pending_deletes = rest;
    for delete in overlapping {
        debug!(path, pending = %delete.path, "waiting for remote delete");
        if let Err(e) = delete.task.await {
            warn!(path = %delete.path, error = %e, "remote delete task failed");
        }
    }
}

/// Absolute form of a symlink target read from `link`'s listing line.
fn resolve_link(link: &str, target: &str) -> String {
    if target.starts_with('/') {
        normalize(target)
    } else {
        normalize(&join(parent_of(link), target))
    }
}
