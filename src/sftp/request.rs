//! Request and reply shapes of the file-transfer protocol layer.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

use crate::errors::GatewayError;
use crate::vfs::{EntryKind, RemoteEntry};

/// Request method names as sent by the protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Open,
    Setstat,
    Rename,
    Rmdir,
    Mkdir,
    Symlink,
    Remove,
    List,
    Stat,
    Readlink,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "Get",
            Method::Put => "Put",
            Method::Open => "Open",
            Method::Setstat => "Setstat",
            Method::Rename => "Rename",
            Method::Rmdir => "Rmdir",
            Method::Mkdir => "Mkdir",
            Method::Symlink => "Symlink",
            Method::Remove => "Remove",
            Method::List => "List",
            Method::Stat => "Stat",
            Method::Readlink => "Readlink",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Get" => Ok(Method::Get),
            "Put" => Ok(Method::Put),
            "Open" => Ok(Method::Open),
            "Setstat" => Ok(Method::Setstat),
            "Rename" => Ok(Method::Rename),
            "Rmdir" => Ok(Method::Rmdir),
            "Mkdir" => Ok(Method::Mkdir),
            "Symlink" => Ok(Method::Symlink),
            "Remove" => Ok(Method::Remove),
            "List" => Ok(Method::List),
            "Stat" => Ok(Method::Stat),
            "Readlink" => Ok(Method::Readlink),
            other => Err(GatewayError::Unsupported(other.to_string())),
        }
    }
}

/// Which fields of [`FileAttributes`] a setstat request carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttrFlags {
    pub size: bool,
    pub uid_gid: bool,
    pub permissions: bool,
    pub acmod_time: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
}

/// One inbound request: a method, the path it targets, the rename target,
/// and attributes for setstat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub filepath: String,
    pub target: String,
    pub flags: AttrFlags,
    pub attrs: FileAttributes,
}

impl Request {
    pub fn new(method: Method, filepath: impl Into<String>) -> Self {
        Self {
            method,
            filepath: filepath.into(),
            target: String::new(),
            flags: AttrFlags::default(),
            attrs: FileAttributes::default(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.flags.permissions = true;
        self.attrs.mode = mode;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.flags.size = true;
        self.attrs.size = size;
        self
    }
}

/// Protocol status codes a handler failure is reported as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    Eof,
    NoSuchFile,
    PermissionDenied,
    Failure,
    OpUnsupported,
}

impl From<&GatewayError> for StatusCode {
    fn from(err: &GatewayError) -> Self {
        match err {
            GatewayError::NotFound(_) => StatusCode::NoSuchFile,
            GatewayError::PermissionDenied(_) => StatusCode::PermissionDenied,
            GatewayError::Unsupported(_) => StatusCode::OpUnsupported,
            _ => StatusCode::Failure,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StatusCode::Ok => "ok",
            StatusCode::Eof => "end of file",
            StatusCode::NoSuchFile => "no such file",
            StatusCode::PermissionDenied => "permission denied",
            StatusCode::Failure => "failure",
            StatusCode::OpUnsupported => "operation unsupported",
        };
        f.write_str(text)
    }
}

/// Metadata of one entry as returned by list, stat and readlink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub modified: SystemTime,
    pub symlink_target: Option<String>,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.mode & 0o170000 == 0o040000
    }

    /// `ls -l` style line for protocol name replies.
    pub fn long_name(&self) -> String {
        let kind = match self.mode & 0o170000 {
            0o040000 => 'd',
            0o120000 => 'l',
            _ => '-',
        };
        let modified: DateTime<Utc> = self.modified.into();
        let mut line = format!(
            "{kind}{} 1 0 0 {:>8} {} {}",
            permission_string(self.mode),
            self.size,
            modified.format("%b %e %H:%M"),
            self.name
        );
        if let Some(target) = &self.symlink_target {
            line.push_str(" -> ");
            line.push_str(target);
        }
        line
    }

    pub fn mtime_secs(&self) -> u64 {
        self.modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

impl From<&RemoteEntry> for FileInfo {
    fn from(entry: &RemoteEntry) -> Self {
        Self {
            name: entry.name().to_string(),
            path: entry.path.clone(),
            size: entry.size(),
            mode: entry.mode(),
            modified: entry.modified,
            symlink_target: match entry.kind {
                EntryKind::Symlink => entry.symlink_target.clone(),
                _ => None,
            },
        }
    }
}

fn permission_string(mode: u32) -> String {
    let mut out = String::with_capacity(9);
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 4 != 0 { 'r' } else { '-' });
        out.push(if bits & 2 != 0 { 'w' } else { '-' });
        out.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    out
}
