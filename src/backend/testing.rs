//! Test utilities for the backend module.
//!
//! [`FakeContainer`] is an in-memory container.  It understands the command
//! set produced by [`crate::shell`], renders `ls` long-format text, speaks
//! tar for copies, and counts what it was asked to do so tests can assert
//! on remote round trips.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;

use super::{ContainerBackend, ExecResult};
use crate::errors::{GatewayError, GatewayResult};
use crate::vfs::{base_name, is_within, join, parent_of};

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
    Symlink(String),
}

#[derive(Debug, Clone)]
struct Inode {
    node: Node,
    mode: u32,
}

/// In-memory container speaking the gateway's remote command dialect.
pub struct FakeContainer {
    nodes: Mutex<BTreeMap<String, Inode>>,
    names: Mutex<HashMap<String, String>>,
    commands: Mutex<Vec<String>>,
    failures: Mutex<Vec<(String, String)>>,
    probes: AtomicUsize,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
    finds: AtomicUsize,
    hold_removals: AtomicBool,
    removal_gate: Semaphore,
    exec_delay: Mutex<Option<std::time::Duration>>,
}

impl Default for FakeContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeContainer {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Inode {
                node: Node::Dir,
                mode: 0o755,
            },
        );
        Self {
            nodes: Mutex::new(nodes),
            names: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            probes: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            finds: AtomicUsize::new(0),
            hold_removals: AtomicBool::new(false),
            removal_gate: Semaphore::new(0),
            exec_delay: Mutex::new(None),
        }
    }

    // -- Seeding -------------------------------------------------------------

    pub fn with_dir(self, path: &str) -> Self {
        self.mkdir_all(path);
        self
    }

    pub fn with_file(self, path: &str, content: &[u8]) -> Self {
        self.mkdir_all(parent_of(path));
        self.nodes.lock().unwrap().insert(
            path.to_string(),
            Inode {
                node: Node::File(content.to_vec()),
                mode: 0o644,
            },
        );
        self
    }

    pub fn with_symlink(self, path: &str, target: &str) -> Self {
        self.mkdir_all(parent_of(path));
        self.nodes.lock().unwrap().insert(
            path.to_string(),
            Inode {
                node: Node::Symlink(target.to_string()),
                mode: 0o777,
            },
        );
        self
    }

    /// Register a running container name → id mapping for `find`.
    pub fn with_container(self, name: &str, id: &str) -> Self {
        self.names
            .lock()
            .unwrap()
            .insert(name.to_string(), id.to_string());
        self
    }

    /// Make every command whose program is `program` fail with `stderr`.
    pub fn fail_command(&self, program: &str, stderr: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((program.to_string(), stderr.to_string()));
    }

    /// Park every `rm` until [`release_removals`](Self::release_removals).
    pub fn hold_removals(&self) {
        self.hold_removals.store(true, Ordering::SeqCst);
    }

    pub fn release_removals(&self) {
        self.hold_removals.store(false, Ordering::SeqCst);
        self.removal_gate.add_permits(1024);
    }

    /// Delay every exec by `delay`.
    pub fn slow_exec(&self, delay: std::time::Duration) {
        *self.exec_delay.lock().unwrap() = Some(delay);
    }

    // -- Inspection ----------------------------------------------------------

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().unwrap().get(path) {
            Some(Inode {
                node: Node::File(data),
                ..
            }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(
            self.nodes.lock().unwrap().get(path),
            Some(Inode { node: Node::Dir, .. })
        )
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.lock().unwrap().contains_key(path)
    }

    pub fn mode(&self, path: &str) -> Option<u32> {
        self.nodes.lock().unwrap().get(path).map(|i| i.mode)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn find_count(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }

    /// Every shell command received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Commands whose program is `program`.
    pub fn commands_of(&self, program: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.starts_with(&format!("{program} ")))
            .collect()
    }

    // -- Filesystem model ----------------------------------------------------

    fn mkdir_all(&self, path: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        let mut current = String::from("/");
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = join(&current, part);
            nodes.entry(current.clone()).or_insert(Inode {
                node: Node::Dir,
                mode: 0o755,
            });
        }
    }

    fn ls_line(path_label: &str, inode: &Inode) -> String {
        let (kind, size, suffix) = match &inode.node {
            Node::Dir => ('d', 4096, String::new()),
            Node::File(data) => ('-', data.len(), String::new()),
            Node::Symlink(target) => ('l', target.len(), format!(" -> {target}")),
        };
        format!(
            "{kind}{} 1 docker docker {size:>5} Jan  1 00:00 {path_label}{suffix}",
            rwx(inode.mode)
        )
    }

    fn run_script(&self, script: &str) -> ExecResult {
        let Some(tokens) = shlex::split(script) else {
            return failure(2, "bash: syntax error");
        };

        if tokens.first().map(String::as_str) == Some("if") {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let path = tokens.get(3).cloned().unwrap_or_default();
            let nodes = self.nodes.lock().unwrap();
            return match nodes.get(&path) {
                Some(inode) => success(format!("{}\n", Self::ls_line(&path, inode))),
                None => success(String::new()),
            };
        }

        let mut stdout = String::new();
        for command in tokens.split(|t| t == "&&") {
            let result = self.run_one(command);
            if result.exit_code != 0 || !result.stderr.is_empty() {
                return result;
            }
            stdout.push_str(&result.stdout_lossy());
        }
        success(stdout)
    }

    fn run_one(&self, argv: &[String]) -> ExecResult {
        let Some(program) = argv.first() else {
            return success(String::new());
        };
        if let Some((_, stderr)) = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| p == program)
        {
            return failure(1, stderr);
        }

        let args: Vec<&str> = argv[1..].iter().map(String::as_str).collect();
        match (program.as_str(), args.as_slice()) {
            ("ls", ["-al", dir]) => self.ls(dir),
            ("mkdir", ["-p", path]) => {
                if let Some(Inode {
                    node: Node::File(_),
                    ..
                }) = self.nodes.lock().unwrap().get(*path)
                {
                    return failure(
                        1,
                        &format!("mkdir: cannot create directory '{path}': File exists\n"),
                    );
                }
                self.mkdir_all(path);
                success(String::new())
            }
            ("touch", [path]) => {
                let mut nodes = self.nodes.lock().unwrap();
                if !nodes.contains_key(parent_of(path)) {
                    return failure(1, &format!("touch: cannot touch '{path}': No such file or directory\n"));
                }
                nodes.entry(path.to_string()).or_insert(Inode {
                    node: Node::File(Vec::new()),
                    mode: 0o644,
                });
                success(String::new())
            }
            ("chmod", [mode, path]) => {
                let Ok(mode) = u32::from_str_radix(mode, 8) else {
                    return failure(1, &format!("chmod: invalid mode: '{mode}'\n"));
                };
                match self.nodes.lock().unwrap().get_mut(*path) {
                    Some(inode) => {
                        inode.mode = mode;
                        success(String::new())
                    }
                    None => failure(1, &format!("chmod: cannot access '{path}': No such file or directory\n")),
                }
            }
            ("truncate", ["-s", size, path]) => {
                let Ok(size) = size.parse::<usize>() else {
                    return failure(1, &format!("truncate: invalid number: '{size}'\n"));
                };
                let mut nodes = self.nodes.lock().unwrap();
                match nodes.get_mut(*path) {
                    Some(Inode {
                        node: Node::File(data),
                        ..
                    }) => {
                        data.resize(size, 0);
                        success(String::new())
                    }
                    Some(_) => failure(1, &format!("truncate: cannot open '{path}' for writing: Is a directory\n")),
                    None => {
                        nodes.insert(
                            path.to_string(),
                            Inode {
                                node: Node::File(vec![0; size]),
                                mode: 0o644,
                            },
                        );
                        success(String::new())
                    }
                }
            }
            ("mv", ["-T", from, to]) => self.mv(from, to, true),
            ("mv", [from, to]) => self.mv(from, to, false),
            ("rm", [flags, path]) => {
                let recursive = flags.contains('r');
                let mut nodes = self.nodes.lock().unwrap();
                match nodes.get(*path) {
                    None => success(String::new()),
                    Some(Inode { node: Node::Dir, .. }) if !recursive => {
                        failure(1, &format!("rm: cannot remove '{path}': Is a directory\n"))
                    }
                    Some(_) => {
                        nodes.retain(|k, _| !is_within(k, path));
                        success(String::new())
                    }
                }
            }
            _ => failure(127, &format!("bash: {program}: command not found\n")),
        }
    }

    /// `mv`, including the move into an existing directory that happens
    /// without `-T`.
    fn mv(&self, from: &str, to: &str, exact: bool) -> ExecResult {
        let mut nodes = self.nodes.lock().unwrap();
        let Some(source_is_dir) = nodes.get(from).map(|i| matches!(i.node, Node::Dir)) else {
            return failure(1, &format!("mv: cannot stat '{from}': No such file or directory\n"));
        };
        let to = match nodes.get(to).map(|i| matches!(i.node, Node::Dir)) {
            Some(true) if !exact => join(to, base_name(from)),
            Some(true) if !source_is_dir => {
                return failure(
                    1,
                    &format!("mv: cannot overwrite directory '{to}' with non-directory\n"),
                );
            }
            Some(true) if nodes.keys().any(|k| k != to && is_within(k, to)) => {
                return failure(
                    1,
                    &format!("mv: cannot move '{from}' to '{to}': Directory not empty\n"),
                );
            }
            Some(false) if source_is_dir => {
                return failure(
                    1,
                    &format!("mv: cannot overwrite non-directory '{to}' with directory '{from}'\n"),
                );
            }
            _ => to.to_string(),
        };
        if to == from {
            return success(String::new());
        }

        nodes.retain(|k, _| !is_within(k, &to));
        let moved: Vec<String> = nodes
            .keys()
            .filter(|k| is_within(k, from))
            .cloned()
            .collect();
        for key in moved {
            if let Some(inode) = nodes.remove(&key) {
                nodes.insert(format!("{to}{}", &key[from.len()..]), inode);
            }
        }
        success(String::new())
    }

    fn ls(&self, dir: &str) -> ExecResult {
        let nodes = self.nodes.lock().unwrap();
        let Some(inode) = nodes.get(dir) else {
            return failure(
                2,
                &format!("ls: cannot access '{dir}': No such file or directory\n"),
            );
        };
        if !matches!(inode.node, Node::Dir) {
            return success(format!("{}\n", Self::ls_line(dir, inode)));
        }

        let mut out = String::from("total 8\n");
        out.push_str(&Self::ls_line(".", inode));
        out.push('\n');
        out.push_str(&Self::ls_line("..", &Inode { node: Node::Dir, mode: 0o755 }));
        out.push('\n');
        for (path, child) in nodes.iter() {
            if path != dir && parent_of(path) == dir {
                out.push_str(&Self::ls_line(base_name(path), child));
                out.push('\n');
            }
        }
        success(out)
    }
}

fn rwx(mode: u32) -> String {
    let mut out = String::with_capacity(9);
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 4 != 0 { 'r' } else { '-' });
        out.push(if bits & 2 != 0 { 'w' } else { '-' });
        out.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    out
}

fn success(stdout: String) -> ExecResult {
    ExecResult {
        stdout: Bytes::from(stdout),
        stderr: Bytes::new(),
        exit_code: 0,
    }
}

fn failure(code: i64, stderr: &str) -> ExecResult {
    ExecResult {
        stdout: Bytes::new(),
        stderr: Bytes::from(stderr.to_string()),
        exit_code: code,
    }
}

#[async_trait]
impl ContainerBackend for FakeContainer {
    async fn exec(&self, _container: &str, _user: &str, argv: &[&str]) -> GatewayResult<ExecResult> {
        let delay = *self.exec_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let script = match argv {
            ["bash", "-lc", script] => script.to_string(),
            _ => return Ok(failure(126, "unsupported invocation\n")),
        };
        self.commands.lock().unwrap().push(script.clone());

        if script.starts_with("rm ") && self.hold_removals.load(Ordering::SeqCst) {
            let _permit = self
                .removal_gate
                .acquire()
                .await
                .map_err(|e| GatewayError::Internal(e.to_string()))?;
        }
        Ok(self.run_script(&script))
    }

    async fn copy_to(
        &self,
        _container: &str,
        remote_dir: &str,
        archive: Bytes,
    ) -> GatewayResult<()> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        if !self.is_dir(remote_dir) {
            return Err(GatewayError::from_transfer(
                remote_dir,
                format!("Could not find the file {remote_dir} in container"),
            ));
        }
        let mut tar = tar::Archive::new(Cursor::new(archive.to_vec()));
        let entries = tar
            .entries()
            .map_err(|e| GatewayError::TransferError(e.to_string()))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| GatewayError::TransferError(e.to_string()))?;
            let name = entry
                .path()
                .map_err(|e| GatewayError::TransferError(e.to_string()))?
                .to_string_lossy()
                .into_owned();
            let mode = entry.header().mode().unwrap_or(0o644) & 0o7777;
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .map_err(|e| GatewayError::TransferError(e.to_string()))?;
            self.nodes.lock().unwrap().insert(
                join(remote_dir, &name),
                Inode {
                    node: Node::File(data),
                    mode,
                },
            );
        }
        Ok(())
    }

    async fn copy_from(&self, _container: &str, remote_path: &str) -> GatewayResult<Bytes> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let inode = self.nodes.lock().unwrap().get(remote_path).cloned();
        let Some(inode) = inode else {
            return Err(GatewayError::from_transfer(
                remote_path,
                format!("Could not find the file {remote_path} in container"),
            ));
        };

        let name = base_name(remote_path);
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_mode(inode.mode);
        let io = |e: std::io::Error| GatewayError::TransferError(e.to_string());
        match &inode.node {
            Node::File(data) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(data.len() as u64);
                builder
                    .append_data(&mut header, name, data.as_slice())
                    .map_err(io)?;
            }
            Node::Dir => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                builder
                    .append_data(&mut header, format!("{name}/"), std::io::empty())
                    .map_err(io)?;
            }
            Node::Symlink(target) => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                header.set_link_name(target).map_err(io)?;
                builder
                    .append_data(&mut header, name, std::io::empty())
                    .map_err(io)?;
            }
        }
        Ok(Bytes::from(builder.into_inner().map_err(io)?))
    }

    async fn find(&self, name: &str) -> GatewayResult<Option<String>> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        Ok(self.names.lock().unwrap().get(name).cloned())
    }

    async fn check(&self) -> GatewayResult<()> {
        Ok(())
    }

    fn description(&self) -> String {
        "fake".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sh(fake: &FakeContainer, script: &str) -> ExecResult {
        fake.exec("c", "docker", &["bash", "-lc", script]).await.unwrap()
    }

    #[tokio::test]
    async fn ls_renders_long_format() {
        let fake = FakeContainer::new()
            .with_dir("/a/bin")
            .with_file("/a/test1.txt", b"hello world");
        let out = sh(&fake, "ls -al '/a'").await.stdout_lossy();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "total 8");
        assert!(lines[1].ends_with(" ."));
        assert!(lines[2].ends_with(" .."));
        assert_eq!(lines[3], "drwxr-xr-x 1 docker docker  4096 Jan  1 00:00 bin");
        assert_eq!(lines[4], "-rw-r--r-- 1 docker docker    11 Jan  1 00:00 test1.txt");
    }

    #[tokio::test]
    async fn probe_counts_and_reports() {
        let fake = FakeContainer::new().with_file("/x", b"1");
        let hit = sh(&fake, &crate::shell::probe("/x")).await;
        let miss = sh(&fake, &crate::shell::probe("/y")).await;
        assert!(hit.stdout_lossy().ends_with(" /x\n"));
        assert!(miss.stdout.is_empty());
        assert_eq!(fake.probe_count(), 2);
    }

    #[tokio::test]
    async fn mv_moves_subtree() {
        let fake = FakeContainer::new().with_file("/d/sub/f", b"x");
        sh(&fake, "mv '/d' '/e'").await;
        assert!(!fake.exists("/d/sub/f"));
        assert_eq!(fake.file("/e/sub/f").unwrap(), b"x");
    }

    #[tokio::test]
    async fn mv_into_existing_directory() {
        let fake = FakeContainer::new().with_dir("/bin").with_file("/f", b"x");
        sh(&fake, "mv '/f' '/bin'").await;
        assert_eq!(fake.file("/bin/f").unwrap(), b"x");
        assert!(fake.is_dir("/bin"));
    }

    #[tokio::test]
    async fn mv_exact_refuses_directory_target() {
        let fake = FakeContainer::new().with_dir("/bin").with_file("/f", b"x");
        let result = sh(&fake, "mv -T '/f' '/bin'").await;
        assert_eq!(result.exit_code, 1);
        assert!(fake.exists("/f"));
        assert!(fake.is_dir("/bin"));

        sh(&fake, "mv -T '/f' '/g'").await;
        assert_eq!(fake.file("/g").unwrap(), b"x");
    }

    #[tokio::test]
    async fn unknown_program_fails() {
        let fake = FakeContainer::new();
        let result = sh(&fake, "reboot").await;
        assert_eq!(result.exit_code, 127);
    }

    #[test]
    fn rwx_rendering() {
        assert_eq!(rwx(0o755), "rwxr-xr-x");
        assert_eq!(rwx(0o640), "rw-r-----");
    }
}
