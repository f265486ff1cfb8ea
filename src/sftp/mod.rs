//! File-transfer protocol adapter.
//!
//! [`Adapter`] plays the four handler roles a protocol server dispatches to:
//!
//! - **read** ([`Adapter::file_read`]): `Get`
//! - **write** ([`Adapter::file_write`]): `Put`, `Open`
//! - **command** ([`Adapter::file_cmd`]): `Setstat`, `Rename`, `Rmdir`,
//!   `Remove`, `Mkdir`, `Symlink`
//! - **list** ([`Adapter::file_list`]): `List`, `Stat`, `Readlink`
//!
//! Every handler works against one session's [`VirtualTree`].  Failures stay
//! [`GatewayError`]s; the protocol layer turns them into a [`StatusCode`].

pub mod request;

pub use request::{AttrFlags, FileAttributes, FileInfo, Method, Request, StatusCode};

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::errors::{GatewayError, GatewayResult};
use crate::vfs::tree::SetAttrs;
use crate::vfs::{VirtualTree, WriteHandle};

/// Random-access reader over a downloaded file.
#[derive(Debug, Clone)]
pub struct ContentReader {
    data: Bytes,
}

impl ContentReader {
    /// Copy bytes starting at `offset` into `buf`.  Returns 0 at or past the
    /// end of the file.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        if start >= self.data.len() {
            return 0;
        }
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        n
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }
}

/// Accepts chunks for one open file; [`FileWriter::close`] pushes the
/// accumulated content to the container.
pub struct FileWriter {
    tree: Arc<VirtualTree>,
    handle: WriteHandle,
}

impl FileWriter {
    pub fn write_at(&mut self, data: &[u8], offset: u64) -> GatewayResult<usize> {
        self.handle.write_at(offset, data)
    }

    pub fn path(&self) -> &str {
        self.handle.path()
    }

    pub async fn close(self) -> GatewayResult<()> {
        self.tree.commit(self.handle).await
    }
}

/// A materialized directory listing served in pages.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    entries: Vec<FileInfo>,
}

impl Listing {
    /// Up to `max` entries starting at `offset`, and whether the listing
    /// ends within this page.
    pub fn list_at(&self, offset: usize, max: usize) -> (&[FileInfo], bool) {
        if offset >= self.entries.len() {
            return (&[], true);
        }
        let end = offset.saturating_add(max).min(self.entries.len());
        (&self.entries[offset..end], end == self.entries.len())
    }

    pub fn entries(&self) -> &[FileInfo] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct Adapter {
    tree: Arc<VirtualTree>,
}

impl Adapter {
    pub fn new(tree: Arc<VirtualTree>) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &Arc<VirtualTree> {
        &self.tree
    }

    pub async fn file_read(&self, req: &Request) -> GatewayResult<ContentReader> {
        debug!(method = %req.method, path = %req.filepath, "file_read");
        match req.method {
            Method::Get => {
                let data = self.tree.read(&req.filepath).await?;
                Ok(ContentReader { data })
            }
            other => Err(GatewayError::Unsupported(other.to_string())),
        }
    }

    pub async fn file_write(&self, req: &Request) -> GatewayResult<FileWriter> {
        debug!(method = %req.method, path = %req.filepath, "file_write");
        match req.method {
            Method::Put | Method::Open => {
                let handle = self.tree.open_write(&req.filepath).await?;
                Ok(FileWriter {
                    tree: self.tree.clone(),
                    handle,
                })
            }
            other => Err(GatewayError::Unsupported(other.to_string())),
        }
    }

    pub async fn file_cmd(&self, req: &Request) -> GatewayResult<()> {
        debug!(method = %req.method, path = %req.filepath, target = %req.target, "file_cmd");
        match req.method {
            Method::Setstat => {
                let attrs = SetAttrs {
                    mode: req.flags.permissions.then_some(req.attrs.mode),
                    size: req.flags.size.then_some(req.attrs.size),
                };
                self.tree.setstat(&req.filepath, attrs).await
            }
            Method::Rename => {
                if req.target.is_empty() {
                    return Err(GatewayError::InvalidOperation(
                        "rename without target".into(),
                    ));
                }
                self.tree.rename(&req.filepath, &req.target).await
            }
            Method::Rmdir | Method::Remove => self.tree.remove(&req.filepath).await,
            Method::Mkdir => self.tree.mkdir(&req.filepath).await,
            Method::Symlink => Ok(()),
            other => Err(GatewayError::Unsupported(other.to_string())),
        }
    }

    pub async fn file_list(&self, req: &Request) -> GatewayResult<Listing> {
        debug!(method = %req.method, path = %req.filepath, "file_list");
        let entries = match req.method {
            Method::List => self.tree.list(&req.filepath).await?,
            Method::Stat => vec![self.tree.fetch(&req.filepath).await?],
            Method::Readlink => vec![self.tree.readlink(&req.filepath).await?],
            other => return Err(GatewayError::Unsupported(other.to_string())),
        };
        Ok(Listing {
            entries: entries.iter().map(FileInfo::from).collect(),
        })
    }
}
