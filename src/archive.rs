//! Archive transfer.
//!
//! The container runtime only copies whole items wrapped in tar streams.
//! Uploads pack a local file into a single-entry archive and extract it
//! into the destination directory; downloads unpack the first regular file
//! of the returned archive into memory.

use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::backend::ContainerBackend;
use crate::errors::{GatewayError, GatewayResult};
use crate::vfs::{base_name, parent_of};

pub struct ArchiveTransfer {
    backend: Arc<dyn ContainerBackend>,
    timeout: Duration,
}

impl ArchiveTransfer {
    pub fn new(backend: Arc<dyn ContainerBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// Pack `local_file` and extract it into `remote_dir` under the same
    /// file name.
    pub async fn upload(&self, container: &str, local_file: &Path, remote_dir: &str) -> GatewayResult<()> {
        let archive = pack(local_file)?;
        debug!(container, file = %local_file.display(), remote_dir, bytes = archive.len(), "upload");
        self.bounded(
            remote_dir,
            self.backend.copy_to(container, remote_dir, archive),
        )
        .await
    }

    /// Fetch `remote_path` and return the contents of the first regular file
    /// in the archive.
    pub async fn download(&self, container: &str, remote_path: &str) -> GatewayResult<Bytes> {
        debug!(container, remote_path, "download");
        let archive = self
            .bounded(remote_path, self.backend.copy_from(container, remote_path))
            .await?;
        unpack_first_file(&archive, remote_path)
    }

    /// Write `data` to a private staging directory and upload it as
    /// `remote_path`.  The staging directory is removed on every exit path.
    pub async fn upload_bytes(&self, container: &str, remote_path: &str, data: &[u8]) -> GatewayResult<()> {
        let staging = tempfile::Builder::new()
            .prefix("ssh2docker-")
            .tempdir()
            .map_err(|e| GatewayError::TransferError(format!("staging directory: {e}")))?;
        let local = staging.path().join(base_name(remote_path));
        tokio::fs::write(&local, data)
            .await
            .map_err(|e| GatewayError::TransferError(format!("staging {}: {e}", local.display())))?;
        self.upload(container, &local, parent_of(remote_path)).await
    }

    async fn bounded<T>(
        &self,
        path: &str,
        fut: impl std::future::Future<Output = GatewayResult<T>>,
    ) -> GatewayResult<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| GatewayError::Timeout {
                command: format!("copy {path}"),
                secs: self.timeout.as_secs(),
            })?
    }
}

/// Build a one-entry tar archive holding `local_file` under its file name.
fn pack(local_file: &Path) -> GatewayResult<Bytes> {
    let name = local_file
        .file_name()
        .ok_or_else(|| GatewayError::TransferError(format!("no file name in {}", local_file.display())))?;
    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_path_with_name(local_file, name)
        .map_err(|e| GatewayError::TransferError(format!("pack {}: {e}", local_file.display())))?;
    let data = builder
        .into_inner()
        .map_err(|e| GatewayError::TransferError(format!("pack {}: {e}", local_file.display())))?;
    Ok(Bytes::from(data))
}

fn unpack_first_file(archive: &[u8], remote_path: &str) -> GatewayResult<Bytes> {
    let decode = |e: std::io::Error| GatewayError::TransferError(format!("unpack {remote_path}: {e}"));
    let mut tar = tar::Archive::new(Cursor::new(archive));
    for entry in tar.entries().map_err(decode)? {
        let mut entry = entry.map_err(decode)?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data).map_err(decode)?;
        return Ok(Bytes::from(data));
    }
    Err(GatewayError::TransferError(format!(
        "no regular file in archive of {remote_path}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FakeContainer;

    fn transfer(fake: Arc<FakeContainer>) -> ArchiveTransfer {
        ArchiveTransfer::new(fake, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn upload_bytes_lands_in_parent_dir() {
        let fake = Arc::new(FakeContainer::new().with_dir("/srv/app"));
        transfer(fake.clone())
            .upload_bytes("c1", "/srv/app/config.yml", b"debug: true\n")
            .await
            .unwrap();
        assert_eq!(fake.file("/srv/app/config.yml").unwrap(), b"debug: true\n");
        assert_eq!(fake.upload_count(), 1);
    }

    #[tokio::test]
    async fn upload_into_missing_dir_is_not_found() {
        let fake = Arc::new(FakeContainer::new());
        let err = transfer(fake)
            .upload_bytes("c1", "/nope/file", b"x")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn upload_local_file() {
        let fake = Arc::new(FakeContainer::new().with_dir("/in"));
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("report.csv");
        std::fs::write(&local, "a,b\n1,2\n").unwrap();
        transfer(fake.clone()).upload("c1", &local, "/in").await.unwrap();
        assert_eq!(fake.file("/in/report.csv").unwrap(), b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn download_returns_file_bytes() {
        let fake = Arc::new(FakeContainer::new().with_file("/a/test1.txt", b"hello world"));
        let data = transfer(fake.clone()).download("c1", "/a/test1.txt").await.unwrap();
        assert_eq!(&data[..], b"hello world");
        assert_eq!(fake.download_count(), 1);
    }

    #[tokio::test]
    async fn download_of_directory_has_no_regular_file() {
        let fake = Arc::new(FakeContainer::new().with_dir("/a"));
        let err = transfer(fake).download("c1", "/a").await.unwrap_err();
        assert!(matches!(err, GatewayError::TransferError(m) if m.contains("no regular file")));
    }

    #[tokio::test]
    async fn download_missing_is_not_found() {
        let fake = Arc::new(FakeContainer::new());
        let err = transfer(fake).download("c1", "/ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn unpack_rejects_garbage() {
        let err = unpack_first_file(&[1u8; 700], "/x").unwrap_err();
        assert!(matches!(err, GatewayError::TransferError(_)));
    }
}
