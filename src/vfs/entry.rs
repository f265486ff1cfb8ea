//! Remote entries and `ls` long-format parsing.

use bytes::Bytes;
use std::time::SystemTime;

use super::base_name;

/// The kind of a remote entry, taken from the first character of the `ls`
/// mode column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryKind {
    #[default]
    File,
    Dir,
    Symlink,
}

/// One cached node of a [`VirtualTree`](super::VirtualTree).
///
/// `content` is `None` until the file has been read or written in this
/// session.  `deleted` is set the moment a remove is accepted, before the
/// remote `rm` has necessarily run; a deleted entry is never handed out.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub path: String,
    pub kind: EntryKind,
    /// Time this entry was created or refreshed in the cache.  The remote
    /// mtime is not parsed.
    pub modified: SystemTime,
    /// Size column as printed by `ls`.
    pub size_hint: String,
    pub content: Option<Bytes>,
    pub symlink_target: Option<String>,
    pub deleted: bool,
    pub container_id: String,
}

impl RemoteEntry {
    pub fn new(path: &str, kind: EntryKind, container_id: &str) -> Self {
        Self {
            path: path.to_string(),
            kind,
            modified: SystemTime::now(),
            size_hint: "0".to_string(),
            content: None,
            symlink_target: None,
            deleted: false,
            container_id: container_id.to_string(),
        }
    }

    /// The synthetic `/` entry every tree starts with.
    pub fn root(container_id: &str) -> Self {
        Self::new("/", EntryKind::Dir, container_id)
    }

    /// Build an entry for `path` from a parsed listing line.
    pub fn from_listing(path: &str, line: ListingLine, container_id: &str) -> Self {
        let mut entry = Self::new(path, line.kind, container_id);
        entry.size_hint = line.size;
        entry.symlink_target = line.symlink_target;
        entry
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    pub fn name(&self) -> &str {
        base_name(&self.path)
    }

    /// Byte size: the cached buffer when present, otherwise the listed size.
    pub fn size(&self) -> u64 {
        match &self.content {
            Some(content) => content.len() as u64,
            None => self.size_hint.parse().unwrap_or(0),
        }
    }

    /// Synthesized POSIX mode bits including the file-type bits.
    pub fn mode(&self) -> u32 {
        match self.kind {
            EntryKind::Dir => 0o040755,
            EntryKind::Symlink => 0o120777,
            EntryKind::File => 0o100644,
        }
    }
}

/// The fields extracted from one `ls -l` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingLine {
    pub name: String,
    pub kind: EntryKind,
    pub size: String,
    pub symlink_target: Option<String>,
}

/// Index of the first name column in `ls -l` output: mode, links, owner,
/// group, size, month, day, time/year come first.
const NAME_COLUMN: usize = 8;

/// Parse one line of `ls -l` output.
///
/// Columns are whitespace-separated; the name is every column from the
/// ninth on, rejoined with single spaces.  Runs of spaces inside a name are
/// therefore collapsed, and a `name -> target` pair is only split for
/// symlink lines.  Block and character devices print `major, minor` where
/// the size goes; their name starts one column later and their size is 0.
/// Returns `None` for the `total` header and for lines too short to carry a
/// name.
pub fn parse_listing_line(line: &str) -> Option<ListingLine> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() <= NAME_COLUMN {
        return None;
    }

    let type_char = fields[0].chars().next();
    let kind = match type_char {
        Some('d') => EntryKind::Dir,
        Some('l') => EntryKind::Symlink,
        _ => EntryKind::File,
    };
    let device = matches!(type_char, Some('b' | 'c')) && fields[4].ends_with(',');
    let (size, name_column) = if device {
        ("0".to_string(), NAME_COLUMN + 1)
    } else {
        (fields[4].to_string(), NAME_COLUMN)
    };
    if fields.len() <= name_column {
        return None;
    }
    let name = fields[name_column..].join(" ");

    let (name, symlink_target) = match kind {
        EntryKind::Symlink => match name.split_once(" -> ") {
            Some((link, target)) => (link.to_string(), Some(target.to_string())),
            None => (name, None),
        },
        _ => (name, None),
    };

    Some(ListingLine {
        name,
        kind,
        size,
        symlink_target,
    })
}
