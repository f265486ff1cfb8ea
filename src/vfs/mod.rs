//! Virtual filesystem synthesized from a container.
//!
//! The container has no file API beyond "run a command" and "copy a tar
//! archive", so the tree is built lazily: [`VirtualTree`] probes paths with
//! shell commands, parses `ls` output into [`RemoteEntry`] values, caches
//! them per session, and pushes whole-file content back through archive
//! uploads.

pub mod entry;
pub mod tree;

pub use entry::{EntryKind, RemoteEntry, parse_listing_line};
pub use tree::{MAX_WRITE_SIZE, VirtualTree, WriteHandle};

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------
//
// Remote paths are absolute, `/`-separated strings.  They are never run
// through `std::path`, whose semantics follow the host, not the container.

/// Return the parent directory of a remote path; `/` is its own parent.
pub fn parent_of(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &trimmed[..idx],
    }
}

/// Last component of a remote path (`/` for the root).
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Join a directory and a child name.
pub fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Whether `path` is `dir` itself or lies lexically underneath it.
pub fn is_within(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return path.starts_with('/');
    }
    path == dir
        || (path.starts_with(dir) && path.as_bytes().get(dir.len()) == Some(&b'/'))
}

/// Normalize a client-supplied path: make it absolute, collapse duplicate
/// separators, resolve `.` and `..` lexically and drop trailing slashes.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}
