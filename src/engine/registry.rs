//! Per-inode identity table.
//!
//! `fuser` addresses everything by a stable 64-bit inode number, not by path,
//! so we keep a small bidirectional table mapping inode -> user-visible path
//! and back. Entries are created on `lookup`/`readdir` and updated in place on
//! `rename`; the table is never shrunk (no `forget`-driven eviction — see
//! `SPEC_FULL.md` §3.1), which trades a slow unbounded-growth leak for the
//! simplicity of never needing a reference count per inode.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Inode number of the mount root. Matches both the FUSE convention and the
/// root handle used throughout the rest of the engine.
pub const ROOT_ID: u64 = 1;

pub struct Registry {
    next_id: u64,
    paths: HashMap<u64, PathBuf>,
    ids: HashMap<PathBuf, u64>,
}

impl Registry {
    pub fn new() -> Self {
        let mut paths = HashMap::new();
        paths.insert(ROOT_ID, PathBuf::from("/"));
        let mut ids = HashMap::new();
        ids.insert(PathBuf::from("/"), ROOT_ID);
        Registry { next_id: ROOT_ID + 1, paths, ids }
    }

    /// User-visible path for an already-known inode.
    pub fn path(&self, ino: u64) -> Option<&Path> {
        self.paths.get(&ino).map(PathBuf::as_path)
    }

    /// Inode for a known path, if one has already been assigned.
    pub fn ino_for_path(&self, path: &Path) -> Option<u64> {
        self.ids.get(path).copied()
    }

    /// Return the inode for `path`, minting a fresh one if this is the first
    /// time the path has been observed.
    pub fn ensure_entry(&mut self, path: &Path) -> u64 {
        if let Some(&ino) = self.ids.get(path) {
            return ino;
        }
        let ino = self.next_id;
        self.next_id += 1;
        self.paths.insert(ino, path.to_path_buf());
        self.ids.insert(path.to_path_buf(), ino);
        ino
    }

    /// Re-point every entry whose path is `from` or nested under `from` to the
    /// corresponding path under `to`. Called after a successful backing rename.
    pub fn rename_entry(&mut self, from: &Path, to: &Path) {
        let affected: Vec<PathBuf> =
            self.ids.keys().filter(|p| p.as_path() == from || p.starts_with(from)).cloned().collect();
        for old_path in affected {
            let Ok(suffix) = old_path.strip_prefix(from) else { continue };
            let new_path = if suffix.as_os_str().is_empty() { to.to_path_buf() } else { to.join(suffix) };
            if let Some(ino) = self.ids.remove(&old_path) {
                self.paths.insert(ino, new_path.clone());
                self.ids.insert(new_path, ino);
            }
        }
    }
}
