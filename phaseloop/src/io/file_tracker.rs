//! Snapshot-based detection of files changed under the project root.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Result;
use tracing::{debug, instrument, warn};
use walkdir::{DirEntry, WalkDir};

/// Directories never tracked or listed.
pub const SKIPPED_DIRS: &[&str] = &[
    ".git",
    "target",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    ".phaseloop",
];

/// Files larger than this are compared by size and mtime only.
const HASH_LIMIT_BYTES: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
    digest: Option<u64>,
}

/// Point-in-time record of the files under a root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    files: BTreeMap<PathBuf, FileStamp>,
}

impl Checkpoint {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub created: BTreeSet<PathBuf>,
    pub modified: BTreeSet<PathBuf>,
    pub deleted: BTreeSet<PathBuf>,
}

impl ChangeSet {
    /// Every path that differs from the checkpoint, sorted.
    pub fn touched(&self) -> BTreeSet<PathBuf> {
        self.created
            .iter()
            .chain(&self.modified)
            .chain(&self.deleted)
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

pub trait ChangeTracker {
    fn checkpoint(&self, root: &Path) -> Result<Checkpoint>;
    fn changes_since(&self, root: &Path, since: &Checkpoint) -> Result<ChangeSet>;

    /// Paths changed since `since`.
    fn changed_files(&self, root: &Path, since: &Checkpoint) -> Result<BTreeSet<PathBuf>> {
        Ok(self.changes_since(root, since)?.touched())
    }
}

/// Walks the tree with `walkdir`, stamping each file with size, mtime and a
/// content digest.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotTracker;

impl ChangeTracker for SnapshotTracker {
    #[instrument(skip_all, fields(root = %root.display()))]
    fn checkpoint(&self, root: &Path) -> Result<Checkpoint> {
        let mut files = BTreeMap::new();
        for rel in project_files(root) {
            if let Some(stamp) = stamp(&root.join(&rel)) {
                files.insert(rel, stamp);
            }
        }
        debug!(files = files.len(), "checkpoint taken");
        Ok(Checkpoint { files })
    }

    fn changes_since(&self, root: &Path, since: &Checkpoint) -> Result<ChangeSet> {
        let now = self.checkpoint(root)?;
        let mut changes = ChangeSet::default();
        for (path, stamp) in &now.files {
            match since.files.get(path) {
                None => {
                    changes.created.insert(path.clone());
                }
                Some(before) if before != stamp => {
                    changes.modified.insert(path.clone());
                }
                Some(_) => {}
            }
        }
        for path in since.files.keys() {
            if !now.files.contains_key(path) {
                changes.deleted.insert(path.clone());
            }
        }
        Ok(changes)
    }
}

fn is_skipped(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

/// Relative paths of all tracked files under `root`, sorted.
pub fn project_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped(e));
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(err = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            out.push(rel.to_path_buf());
        }
    }
    out
}

/// Newline-separated listing of project files, capped at `limit` entries.
pub fn project_layout(root: &Path, limit: usize) -> String {
    let files = project_files(root);
    let mut listing: Vec<String> = files
        .iter()
        .take(limit)
        .map(|p| p.display().to_string())
        .collect();
    if files.len() > limit {
        listing.push(format!("... and {} more", files.len() - limit));
    }
    listing.join("\n")
}

fn stamp(path: &Path) -> Option<FileStamp> {
    let meta = fs::metadata(path).ok()?;
    let len = meta.len();
    let digest = if len <= HASH_LIMIT_BYTES {
        fs::read(path).ok().map(|bytes| {
            let mut hasher = DefaultHasher::new();
            bytes.hash(&mut hasher);
            hasher.finish()
        })
    } else {
        None
    };
    Some(FileStamp {
        len,
        modified: meta.modified().ok(),
        digest,
    })
}
