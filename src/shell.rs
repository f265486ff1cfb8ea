//! Remote command builders.
//!
//! Every command the gateway sends into a container is assembled here, and
//! every path argument goes through [`quote`].  Nothing else in the crate
//! formats shell text.

/// Shell-escape a string for safe embedding in `bash -c '…'` commands.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Existence probe: prints one `ls -ald` line when `path` exists (dangling
/// symlinks included), nothing otherwise.
pub fn probe(path: &str) -> String {
    let p = quote(path);
    format!("if [ -e {p} ] || [ -L {p} ]; then ls -ald {p}; fi")
}

/// Long-format listing of a directory, hidden entries included.
pub fn list(dir: &str) -> String {
    format!("ls -al {}", quote(dir))
}

/// Create an empty file (and its parent directory) without uploading.
pub fn touch(path: &str) -> String {
    let parent = crate::vfs::parent_of(path);
    format!("mkdir -p {} && touch {}", quote(parent), quote(path))
}

/// Set permission bits; `mode` is rendered as bare octal.
pub fn chmod(mode: u32, path: &str) -> String {
    format!("chmod {:o} {}", mode & 0o7777, quote(path))
}

pub fn truncate(size: u64, path: &str) -> String {
    format!("truncate -s {size} {}", quote(path))
}

/// Move `from` to exactly `to`.  `-T` stops `mv` from dropping the source
/// inside `to` when `to` is an existing directory.
pub fn rename(from: &str, to: &str) -> String {
    format!("mv -T {} {}", quote(from), quote(to))
}

/// Remove a file, or a whole directory tree when `recursive`.
pub fn remove(path: &str, recursive: bool) -> String {
    let flags = if recursive { "-rf" } else { "-f" };
    format!("rm {flags} {}", quote(path))
}

pub fn mkdir(path: &str) -> String {
    format!("mkdir -p {}", quote(path))
}
