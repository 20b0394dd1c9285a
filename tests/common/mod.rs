use std::path::Path;

use revisionfs::engine::Engine;
use tempfile::TempDir;

/// Wraps a fresh backing root and the engine mounted on top of it, in the
/// style the teacher uses for its own host-filesystem-backed fixtures.
pub struct Fixture {
    pub tempdir: TempDir,
    pub engine: Engine,
}

impl Fixture {
    pub fn new() -> Self {
        let tempdir = TempDir::new().expect("create temp dir");
        let engine = Engine::new(tempdir.path().to_path_buf(), "cp -a".to_string());
        Fixture { tempdir, engine }
    }

    /// Backing-root path of a revision's version directory, for asserting on
    /// raw on-disk layout (sentinels, revision file names).
    pub fn version_dir(&self, user_path: &str) -> std::path::PathBuf {
        revisionfs::path::version_dir(self.tempdir.path(), Path::new(user_path)).unwrap()
    }
}
