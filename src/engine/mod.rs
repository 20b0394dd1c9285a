//! The versioning engine: the state machine that turns ordinary POSIX
//! operations on user paths into operations on version directories.
//!
//! A version directory can hold, at any time:
//!   - a `dir` sentinel, marking the node as a directory;
//!   - a `deleted` sentinel, marking the node as tombstoned;
//!   - any number of numerically named revision files (`0`, `1`, `2`, ...),
//!     the largest of which is the current content.
//!
//! Combining these yields the five states from `SPEC_FULL.md` §2: Absent,
//! LiveFile(N), TombFile(N), LiveDir, TombDir. Nothing here performs path
//! mangling directly (see [`crate::path`]) or raw syscalls (see
//! [`crate::backing`]) — this module only sequences the two.

mod registry;

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::backing::{self, Attr};
use crate::error::{FsError, FsResult};
use crate::path::{self, SENTINEL_DELETED, SENTINEL_DIR};

pub use registry::ROOT_ID;
use registry::Registry;

/// The state a version directory currently encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Absent,
    LiveFile(u64),
    TombFile(u64),
    LiveDir,
    TombDir,
}

impl NodeState {
    pub fn exists(self) -> bool {
        !matches!(self, NodeState::Absent)
    }

    pub fn is_dir(self) -> bool {
        matches!(self, NodeState::LiveDir | NodeState::TombDir)
    }

    pub fn is_tombstoned(self) -> bool {
        matches!(self, NodeState::TombFile(_) | NodeState::TombDir)
    }
}

/// An entry observed while listing a directory, demangled and ready for the
/// dispatcher to report back through `readdir`.
pub struct DirEntry {
    pub name: std::ffi::OsString,
    pub ino: u64,
    pub is_dir: bool,
}

/// The versioning engine. One instance is shared (behind an `Arc`) across all
/// dispatcher callbacks.
pub struct Engine {
    root: PathBuf,
    clone_command: String,
    registry: Mutex<Registry>,
}

impl Engine {
    pub fn new(root: PathBuf, clone_command: String) -> Self {
        Engine { root, clone_command, registry: Mutex::new(Registry::new()) }
    }

    pub fn root_ino(&self) -> u64 {
        ROOT_ID
    }

    /// Resolve an inode to its current user-visible path.
    pub async fn path_for_ino(&self, ino: u64) -> FsResult<PathBuf> {
        let registry = self.registry.lock().await;
        registry.path(ino).map(Path::to_path_buf).ok_or(FsError::NotFound)
    }

    /// Register (or look up) the inode for `path`, typically after a `lookup`
    /// or `readdir` has confirmed the path exists.
    pub async fn ensure_ino(&self, path: &Path) -> u64 {
        self.registry.lock().await.ensure_entry(path)
    }

    fn version_dir(&self, user_path: &Path) -> FsResult<PathBuf> {
        path::version_dir(&self.root, user_path)
    }

    /// Inspect a version directory and classify its current state. Missing
    /// or unreadable directories are simply `Absent` — this mirrors the
    /// original implementation's failure-tolerant scan.
    #[instrument(skip(self))]
    pub async fn node_state(&self, user_path: &Path) -> FsResult<NodeState> {
        let vdir = self.version_dir(user_path)?;
        let names = match backing::read_dir_names(&vdir).await {
            Ok(names) => names,
            Err(_) => return Ok(NodeState::Absent),
        };

        let mut is_dir = false;
        let mut is_tomb = false;
        let mut latest: i64 = -1;
        for name in &names {
            if name == SENTINEL_DIR {
                is_dir = true;
            } else if name == SENTINEL_DELETED {
                is_tomb = true;
            } else if let Some(rev) = path::parse_revision(name) {
                latest = latest.max(rev as i64);
            }
        }

        Ok(match (is_dir, is_tomb) {
            (true, true) => NodeState::TombDir,
            (true, false) => NodeState::LiveDir,
            (false, true) if latest >= 0 => NodeState::TombFile(latest as u64),
            (false, false) if latest >= 0 => NodeState::LiveFile(latest as u64),
            _ => NodeState::Absent,
        })
    }

    /// Resolve a user path for reading: the path of its latest revision file.
    /// Tombstoned and absent nodes are both reported as `NotFound` — a
    /// tombstone is invisible to ordinary reads.
    pub async fn resolve_for_read(&self, user_path: &Path) -> FsResult<PathBuf> {
        let vdir = self.version_dir(user_path)?;
        match self.node_state(user_path).await? {
            NodeState::LiveFile(rev) => Ok(vdir.join(rev.to_string())),
            NodeState::LiveDir => Err(FsError::IsDir),
            NodeState::TombFile(_) | NodeState::TombDir | NodeState::Absent => Err(FsError::NotFound),
        }
    }

    /// Resolve a user path for writing: clone the latest revision forward by
    /// one (or create revision `0` if the node did not exist yet),
    /// untombstoning it if necessary, and return the path of the new revision.
    #[instrument(skip(self))]
    pub async fn resolve_for_write(&self, user_path: &Path) -> FsResult<PathBuf> {
        let vdir = self.version_dir(user_path)?;
        match self.node_state(user_path).await? {
            NodeState::LiveDir | NodeState::TombDir => Err(FsError::IsDir),
            NodeState::Absent => {
                if !backing::exists(&vdir).await {
                    self.create_version_dir(&vdir).await?;
                }
                let new_rev = vdir.join("0");
                backing::create_exclusive(&new_rev, 0o644).await?;
                Ok(new_rev)
            }
            NodeState::LiveFile(rev) => {
                let new_rev = vdir.join((rev + 1).to_string());
                self.clone_revision(&vdir.join(rev.to_string()), &new_rev).await?;
                Ok(new_rev)
            }
            NodeState::TombFile(rev) => {
                // Untombstoning returns a fresh revision, not a clone of the
                // tombstoned content — the caller writes it from scratch.
                let new_rev = vdir.join((rev + 1).to_string());
                backing::create_exclusive(&new_rev, 0o644).await?;
                self.remove_sentinel(&vdir, SENTINEL_DELETED).await?;
                Ok(new_rev)
            }
        }
    }

    async fn clone_revision(&self, from: &Path, to: &Path) -> FsResult<()> {
        if backing::exists(to).await {
            // Another writer raced us to the same new revision number; the
            // original implementation does not retry, and neither do we.
            return Err(FsError::Exists);
        }
        backing::clone_file(&self.clone_command, from, to).await
    }

    async fn create_version_dir(&self, vdir: &Path) -> FsResult<()> {
        backing::mkdir(vdir, 0o755).await
    }

    async fn remove_sentinel(&self, vdir: &Path, name: &str) -> FsResult<()> {
        match backing::remove_file(&vdir.join(name)).await {
            Ok(()) => Ok(()),
            Err(FsError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Mark an existing node as deleted without destroying its revision
    /// history. A directory may only be tombstoned once confirmed empty of
    /// live children by the dispatcher.
    pub async fn tombstone(&self, user_path: &Path) -> FsResult<()> {
        let vdir = self.version_dir(user_path)?;
        match self.node_state(user_path).await? {
            NodeState::Absent | NodeState::TombFile(_) | NodeState::TombDir => Err(FsError::NotFound),
            NodeState::LiveFile(_) | NodeState::LiveDir => {
                backing::create_exclusive(&vdir.join(SENTINEL_DELETED), 0o644).await
            }
        }
    }

    /// Create a brand-new directory node. Fails with `EEXIST` if anything —
    /// live or tombstoned, file or directory — already occupies the path;
    /// see `SPEC_FULL.md` §7 for why a tombstoned file still blocks `mkdir`.
    pub async fn create_directory(&self, user_path: &Path, mode: u32) -> FsResult<()> {
        let vdir = self.version_dir(user_path)?;
        if self.node_state(user_path).await?.exists() {
            return Err(FsError::Exists);
        }
        self.create_version_dir(&vdir).await?;
        backing::create_exclusive(&vdir.join(SENTINEL_DIR), mode & 0o7777).await
    }

    /// Create a regular file node. A brand-new path gets revision `0`; a
    /// tombstoned path is untombstoned and gets the next revision instead of
    /// being rejected — `create`/`mknod` (unlike `mkdir`) must be able to
    /// resurrect a path a prior `unlink` tombstoned (§4.5 row `T-N`).
    pub async fn create_file(&self, user_path: &Path, mode: u32) -> FsResult<PathBuf> {
        let vdir = self.version_dir(user_path)?;
        match self.node_state(user_path).await? {
            NodeState::Absent => {
                self.create_version_dir(&vdir).await?;
                let rev0 = vdir.join("0");
                backing::create_exclusive(&rev0, mode & 0o7777).await?;
                Ok(rev0)
            }
            NodeState::TombFile(rev) => {
                let new_rev = vdir.join((rev + 1).to_string());
                backing::create_exclusive(&new_rev, mode & 0o7777).await?;
                self.remove_sentinel(&vdir, SENTINEL_DELETED).await?;
                Ok(new_rev)
            }
            NodeState::LiveFile(_) | NodeState::LiveDir | NodeState::TombDir => Err(FsError::Exists),
        }
    }

    /// Current attributes for a user path, derived from the backing metadata
    /// of whichever file currently represents it (latest revision for files,
    /// the `dir` sentinel's directory itself for directories).
    pub async fn attr(&self, user_path: &Path) -> FsResult<Attr> {
        let vdir = self.version_dir(user_path)?;
        match self.node_state(user_path).await? {
            NodeState::LiveFile(rev) => backing::lstat(&vdir.join(rev.to_string())).await,
            NodeState::LiveDir => backing::lstat(&vdir).await,
            NodeState::TombFile(_) | NodeState::TombDir | NodeState::Absent => Err(FsError::NotFound),
        }
    }

    /// List the live (non-tombstoned) children of a directory node, demangled
    /// and registered with fresh inodes as needed.
    pub async fn read_directory(&self, user_path: &Path) -> FsResult<Vec<DirEntry>> {
        match self.node_state(user_path).await? {
            NodeState::LiveDir => {}
            NodeState::TombDir | NodeState::Absent => return Err(FsError::NotFound),
            NodeState::LiveFile(_) | NodeState::TombFile(_) => return Err(FsError::NotDir),
        }
        let vdir = self.version_dir(user_path)?;
        let names = backing::read_dir_names(&vdir).await?;

        let mut children = Vec::new();
        for raw in names {
            let Some(demangled) = path::demangle(&raw) else { continue };
            let child_user_path = user_path.join(&demangled);
            let state = self.node_state(&child_user_path).await?;
            if state.is_tombstoned() || !state.exists() {
                continue;
            }
            let ino = self.ensure_ino(&child_user_path).await;
            children.push(DirEntry { name: demangled, ino, is_dir: state.is_dir() });
        }
        debug!(count = children.len(), "listed directory");
        Ok(children)
    }

    /// Rename `from` to `to`. A directory moves its whole version directory
    /// (and every inode registered under it) in one backing `rename(2)`. A
    /// regular file instead tombstones the source and clones its latest
    /// revision onto a freshly allocated revision at the destination — the
    /// source's revision history stays where it is, just marked deleted,
    /// rather than being physically relocated.
    #[instrument(skip(self))]
    pub async fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        match self.node_state(from).await? {
            NodeState::Absent | NodeState::TombFile(_) | NodeState::TombDir => Err(FsError::NotFound),
            NodeState::LiveDir => {
                let from_vdir = self.version_dir(from)?;
                let to_vdir = self.version_dir(to)?;
                backing::rename(&from_vdir, &to_vdir).await?;
                self.note_rename(from, to).await;
                Ok(())
            }
            NodeState::LiveFile(rev) => {
                let from_vdir = self.version_dir(from)?;
                let source_rev = from_vdir.join(rev.to_string());
                let dest_rev = self.resolve_for_write(to).await?;
                self.tombstone(from).await?;
                if let Err(e) = backing::clone_file(&self.clone_command, &source_rev, &dest_rev).await {
                    self.remove_sentinel(&from_vdir, SENTINEL_DELETED).await?;
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Re-home every identity-table entry under `from` to `to` after a
    /// successful backing rename. The engine itself holds no per-node state
    /// beyond the version directories, so this only needs to update inodes.
    pub async fn note_rename(&self, from: &Path, to: &Path) {
        self.registry.lock().await.rename_entry(from, to);
    }

    pub fn backing_root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    fn engine(dir: &TempDir) -> Engine {
        Engine::new(dir.path().to_path_buf(), "cp -a".to_string())
    }

    #[tokio::test]
    async fn writing_new_path_creates_revision_zero() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let rev_path = engine.resolve_for_write(Path::new("/a")).await.unwrap();
        assert_eq!(rev_path.file_name().unwrap(), "0");
        assert_eq!(engine.node_state(Path::new("/a")).await.unwrap(), NodeState::LiveFile(0));
    }

    #[tokio::test]
    async fn second_write_clones_forward_and_preserves_earlier_revision() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let rev0 = engine.resolve_for_write(Path::new("/a")).await.unwrap();
        tokio::fs::File::options().write(true).open(&rev0).await.unwrap().write_all(b"v0").await.unwrap();

        let rev1 = engine.resolve_for_write(Path::new("/a")).await.unwrap();
        assert_eq!(rev1.file_name().unwrap(), "1");
        assert_eq!(tokio::fs::read(&rev0).await.unwrap(), b"v0");
        assert_eq!(tokio::fs::read(&rev1).await.unwrap(), b"v0");
        assert_eq!(engine.node_state(Path::new("/a")).await.unwrap(), NodeState::LiveFile(1));
    }

    #[tokio::test]
    async fn tombstoned_file_is_invisible_to_read_but_writable_again() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine.resolve_for_write(Path::new("/a")).await.unwrap();
        engine.tombstone(Path::new("/a")).await.unwrap();

        assert_eq!(engine.resolve_for_read(Path::new("/a")).await, Err(FsError::NotFound));
        assert_eq!(engine.node_state(Path::new("/a")).await.unwrap(), NodeState::TombFile(0));

        let rev1 = engine.resolve_for_write(Path::new("/a")).await.unwrap();
        assert_eq!(rev1.file_name().unwrap(), "1");
        assert_eq!(engine.node_state(Path::new("/a")).await.unwrap(), NodeState::LiveFile(1));
    }

    #[tokio::test]
    async fn directory_creation_then_listing_is_empty() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine.create_directory(Path::new("/d"), 0o755).await.unwrap();
        assert_eq!(engine.node_state(Path::new("/d")).await.unwrap(), NodeState::LiveDir);
        let entries = engine.read_directory(Path::new("/d")).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn mkdir_over_tombstoned_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine.resolve_for_write(Path::new("/a")).await.unwrap();
        engine.tombstone(Path::new("/a")).await.unwrap();
        let err = engine.create_directory(Path::new("/a"), 0o755).await.unwrap_err();
        assert_eq!(err, FsError::Exists);
    }

    #[tokio::test]
    async fn create_file_over_tombstoned_file_untombstones_and_allocates() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine.resolve_for_write(Path::new("/a")).await.unwrap();
        engine.tombstone(Path::new("/a")).await.unwrap();

        let rev1 = engine.create_file(Path::new("/a"), 0o644).await.unwrap();
        assert_eq!(rev1.file_name().unwrap(), "1");
        assert_eq!(engine.node_state(Path::new("/a")).await.unwrap(), NodeState::LiveFile(1));
    }

    #[tokio::test]
    async fn create_file_over_live_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine.resolve_for_write(Path::new("/a")).await.unwrap();
        let err = engine.create_file(Path::new("/a"), 0o644).await.unwrap_err();
        assert_eq!(err, FsError::Exists);
    }

    #[tokio::test]
    async fn rename_of_regular_file_tombstones_source_and_clones_content() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let rev0 = engine.resolve_for_write(Path::new("/a")).await.unwrap();
        tokio::fs::write(&rev0, b"hi").await.unwrap();

        engine.rename(Path::new("/a"), Path::new("/b")).await.unwrap();

        assert_eq!(engine.node_state(Path::new("/a")).await.unwrap(), NodeState::TombFile(0));
        assert_eq!(engine.resolve_for_read(Path::new("/a")).await, Err(FsError::NotFound));

        let dest = engine.resolve_for_read(Path::new("/b")).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn rename_of_missing_source_fails_not_found() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let err = engine.rename(Path::new("/missing"), Path::new("/b")).await.unwrap_err();
        assert_eq!(err, FsError::NotFound);
    }

    #[tokio::test]
    async fn readdir_skips_tombstoned_children() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine.create_directory(Path::new("/d"), 0o755).await.unwrap();
        engine.resolve_for_write(Path::new("/d/a")).await.unwrap();
        engine.resolve_for_write(Path::new("/d/b")).await.unwrap();
        engine.tombstone(Path::new("/d/b")).await.unwrap();

        let entries = engine.read_directory(Path::new("/d")).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec![std::ffi::OsString::from("a")]);
    }

    #[tokio::test]
    async fn rename_updates_registered_descendants() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let child_ino = engine.ensure_ino(Path::new("/a/b")).await;
        engine.note_rename(Path::new("/a"), Path::new("/z")).await;
        assert_eq!(engine.path_for_ino(child_ino).await.unwrap(), Path::new("/z/b"));
    }
}
