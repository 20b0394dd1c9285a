//! Backing-store adapter: thin, typed wrapper over POSIX directory/file/link
//! operations on the backing root. Everything here forwards to the host
//! filesystem; no version-directory semantics live in this module (see
//! [`crate::engine`] for that).

use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::process::Stdio;

use tokio::fs::{self, File, OpenOptions};
use tokio::process::Command;

use crate::error::{FsError, FsResult};

/// Attributes this filesystem tracks and can report back through `getattr`.
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub is_dir: bool,
    pub is_symlink: bool,
    pub size: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: std::time::SystemTime,
    pub mtime: std::time::SystemTime,
    pub ctime: std::time::SystemTime,
}

impl Attr {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Attr {
            is_dir: meta.is_dir(),
            is_symlink: meta.file_type().is_symlink(),
            size: meta.len(),
            mode: meta.mode(),
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            atime: meta.accessed().unwrap_or(std::time::UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(std::time::UNIX_EPOCH),
            ctime: std::time::UNIX_EPOCH + std::time::Duration::new(meta.ctime().max(0) as u64, 0),
        }
    }
}

/// Dynamic filesystem statistics, as returned by `statvfs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStats {
    pub block_size: u64,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_max: u32,
}

/// Fetch attributes for `path`, following symlinks for everything except the
/// leaf (mirrors `lstat` semantics: we want to observe the symlink itself).
pub async fn lstat(path: &Path) -> FsResult<Attr> {
    let meta = fs::symlink_metadata(path).await?;
    Ok(Attr::from_metadata(&meta))
}

/// Whether `path` exists at all (regardless of type).
pub async fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).await.is_ok()
}

/// Create an empty regular file with the given mode, failing if it already exists.
pub async fn create_exclusive(path: &Path, mode: u32) -> FsResult<()> {
    OpenOptions::new().write(true).create_new(true).mode(mode).open(path).await?;
    Ok(())
}

/// Open a regular file for reading.
pub async fn open_read(path: &Path) -> FsResult<File> {
    Ok(File::open(path).await?)
}

/// Open a regular file for writing (without truncating); the file must already exist.
pub async fn open_write(path: &Path) -> FsResult<File> {
    Ok(OpenOptions::new().write(true).open(path).await?)
}

/// Truncate or extend `path` to exactly `len` bytes.
pub async fn set_len(path: &Path, len: u64) -> FsResult<()> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(len).await?;
    Ok(())
}

/// Apply a POSIX mode to `path`.
pub async fn chmod(path: &Path, mode: u32) -> FsResult<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
    })
    .await
    .map_err(|_| FsError::Io)??;
    Ok(())
}

/// Apply ownership to `path`. A `None` component leaves that half unchanged.
pub async fn chown(path: &Path, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        rustix::fs::chown(
            &path,
            uid.map(|u| unsafe { rustix::fs::Uid::from_raw(u) }),
            gid.map(|g| unsafe { rustix::fs::Gid::from_raw(g) }),
        )
        .map_err(|_| FsError::Io)
    })
    .await
    .map_err(|_| FsError::Io)??;
    Ok(())
}

/// Apply access/modification timestamps to `path`.
pub async fn set_times(
    path: &Path,
    atime: Option<std::time::SystemTime>,
    mtime: Option<std::time::SystemTime>,
) -> FsResult<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        use rustix::fs::{Timestamps, UTIME_OMIT};
        let to_timespec = |t: Option<std::time::SystemTime>| match t {
            Some(t) => {
                let dur = t.duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
                rustix::fs::Timespec {
                    tv_sec: dur.as_secs() as _,
                    tv_nsec: dur.subsec_nanos() as _,
                }
            }
            None => rustix::fs::Timespec { tv_sec: 0, tv_nsec: UTIME_OMIT as _ },
        };
        let timestamps =
            Timestamps { last_access: to_timespec(atime), last_modification: to_timespec(mtime) };
        rustix::fs::utimensat(
            rustix::fs::CWD,
            &path,
            &timestamps,
            rustix::fs::AtFlags::empty(),
        )
        .map_err(|_| FsError::Io)
    })
    .await
    .map_err(|_| FsError::Io)??;
    Ok(())
}

/// Create a directory with an explicit mode (bypassing the process umask).
pub async fn mkdir(path: &Path, mode: u32) -> FsResult<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        rustix::fs::mkdirat(rustix::fs::CWD, &path, rustix::fs::Mode::from_raw_mode(mode))
            .map_err(|e| match e {
                rustix::io::Errno::EXIST => FsError::Exists,
                _ => FsError::Io,
            })
    })
    .await
    .map_err(|_| FsError::Io)??;
    Ok(())
}

/// Remove an empty, non-mangled directory.
pub async fn remove_dir(path: &Path) -> FsResult<()> {
    fs::remove_dir(path).await?;
    Ok(())
}

/// Remove a regular file or symlink.
pub async fn remove_file(path: &Path) -> FsResult<()> {
    fs::remove_file(path).await?;
    Ok(())
}

/// List raw entry names of a directory (no filtering; callers demangle).
pub async fn read_dir_names(path: &Path) -> FsResult<Vec<std::ffi::OsString>> {
    let mut read_dir = fs::read_dir(path).await?;
    let mut names = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        names.push(entry.file_name());
    }
    Ok(names)
}

/// Create a symlink at `link_path` pointing at `target`.
pub async fn symlink(target: &Path, link_path: &Path) -> FsResult<()> {
    let target = target.to_path_buf();
    let link_path = link_path.to_path_buf();
    tokio::task::spawn_blocking(move || std::os::unix::fs::symlink(&target, &link_path))
        .await
        .map_err(|_| FsError::Io)??;
    Ok(())
}

/// Read the target of a symlink.
pub async fn read_link(path: &Path) -> FsResult<std::path::PathBuf> {
    Ok(fs::read_link(path).await?)
}

/// Create a hard link at `link_path` pointing at the same backing inode as `source`.
pub async fn hard_link(source: &Path, link_path: &Path) -> FsResult<()> {
    fs::hard_link(source, link_path).await?;
    Ok(())
}

/// Rename `from` to `to`, atomically replacing `to` if it already exists (per POSIX rename).
pub async fn rename(from: &Path, to: &Path) -> FsResult<()> {
    fs::rename(from, to).await?;
    Ok(())
}

/// Evaluate whether `mask` (an `R_OK`/`W_OK`/`X_OK`/`F_OK` combination) is granted for `path`.
pub async fn access(path: &Path, mask: i32) -> FsResult<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let access_mode = if mask == libc::F_OK {
            rustix::fs::Access::EXISTS
        } else {
            let mut flags = rustix::fs::Access::empty();
            if mask & libc::R_OK != 0 {
                flags |= rustix::fs::Access::READ_OK;
            }
            if mask & libc::W_OK != 0 {
                flags |= rustix::fs::Access::WRITE_OK;
            }
            if mask & libc::X_OK != 0 {
                flags |= rustix::fs::Access::EXEC_OK;
            }
            flags
        };
        rustix::fs::access(&path, access_mode).map_err(|_| FsError::NotFound)
    })
    .await
    .map_err(|_| FsError::Io)??;
    Ok(())
}

/// Query dynamic statistics for the filesystem hosting `path`.
pub async fn statvfs(path: &Path) -> FsResult<FsStats> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let stat = rustix::fs::statvfs(&path).map_err(|_| FsError::Io)?;
        Ok(FsStats {
            block_size: stat.f_bsize,
            blocks: stat.f_blocks,
            blocks_free: stat.f_bfree,
            blocks_available: stat.f_bavail,
            files: stat.f_files,
            files_free: stat.f_ffree,
            name_max: stat.f_namemax as u32,
        })
    })
    .await
    .map_err(|_| FsError::Io)?
}

/// Attribute-preserving copy of `src` to `dst`, delegated to an external copy
/// utility (default `cp -a`) invoked as a child process. A non-zero exit status
/// or termination by signal is an `EIO`-class failure, matching the original
/// implementation's fork/exec/waitpid contract.
pub async fn clone_file(clone_command: &str, src: &Path, dst: &Path) -> FsResult<()> {
    let mut parts = clone_command.split_whitespace();
    let program = parts.next().ok_or(FsError::Io)?;
    let status = Command::new(program)
        .args(parts)
        .arg(src)
        .arg(dst)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|_| FsError::Io)?;
    if status.success() {
        Ok(())
    } else {
        Err(FsError::Io)
    }
}
