//! Kernel-callback dispatcher: the `fuser::Filesystem` implementation that
//! maps POSIX filesystem operations onto [`crate::engine::Engine`] calls.
//!
//! `fuser` callbacks are synchronous (`&mut self`, no `.await`), while the
//! engine and backing adapter are async (`tokio::fs`-based). Each callback
//! bridges the two with a single `self.runtime.block_on(...)` call — the
//! same "hold a runtime handle, block on it per request" pattern used
//! wherever a sync trait boundary meets an async implementation.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use tracing::{error, warn};

use crate::backing::Attr;
use crate::engine::{DirEntry, Engine};
use crate::error::FsError;

/// How long the kernel is allowed to cache attribute/entry replies before
/// re-asking us. Kept short: revisions can be created by any write, and a
/// stale cache would hide them.
const TTL: Duration = Duration::from_secs(1);

enum OpenHandle {
    File(tokio::fs::File),
    Dir(Vec<DirEntry>),
}

struct HandleTable {
    next: AtomicU64,
    handles: tokio::sync::Mutex<HashMap<u64, OpenHandle>>,
}

impl HandleTable {
    fn new() -> Self {
        HandleTable { next: AtomicU64::new(1), handles: tokio::sync::Mutex::new(HashMap::new()) }
    }

    fn insert(&self, handle: OpenHandle) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        self.handles.blocking_lock().insert(fh, handle);
        fh
    }

    fn remove(&self, fh: u64) -> Option<OpenHandle> {
        self.handles.blocking_lock().remove(&fh)
    }

    fn with_dir<R>(&self, fh: u64, f: impl FnOnce(&[DirEntry]) -> R) -> Option<R> {
        let handles = self.handles.blocking_lock();
        match handles.get(&fh) {
            Some(OpenHandle::Dir(entries)) => Some(f(entries)),
            _ => None,
        }
    }
}

/// The mounted filesystem. Cheap to clone the inner `Arc<Engine>` into, but
/// `fuser` drives a single owner, so this struct owns the engine directly.
pub struct RevisionFs {
    engine: Arc<Engine>,
    runtime: tokio::runtime::Handle,
    open_files: HandleTable,
    open_dirs: HandleTable,
}

impl RevisionFs {
    pub fn new(engine: Arc<Engine>, runtime: tokio::runtime::Handle) -> Self {
        RevisionFs { engine, runtime, open_files: HandleTable::new(), open_dirs: HandleTable::new() }
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    fn path_of(&self, ino: u64) -> Result<std::path::PathBuf, FsError> {
        self.block_on(self.engine.path_for_ino(ino))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<std::path::PathBuf, FsError> {
        Ok(self.path_of(parent)?.join(name))
    }

    fn entry_reply(&self, reply: ReplyEntry, user_path: &Path) {
        match self.block_on(async {
            let attr = self.engine.attr(user_path).await?;
            let ino = self.engine.ensure_ino(user_path).await;
            Ok::<_, FsError>((ino, attr))
        }) {
            Ok((ino, attr)) => reply.entry(&TTL, &file_attr(ino, &attr), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn attr_reply(&self, reply: ReplyAttr, ino: u64, user_path: &Path) {
        match self.block_on(self.engine.attr(user_path)) {
            Ok(attr) => reply.attr(&TTL, &file_attr(ino, &attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

fn file_attr(ino: u64, attr: &Attr) -> FileAttr {
    let kind = if attr.is_symlink {
        FileType::Symlink
    } else if attr.is_dir {
        FileType::Directory
    } else {
        FileType::RegularFile
    };
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind,
        perm: (attr.mode & 0o7777) as u16,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn time_or_now(t: Option<TimeOrNow>) -> Option<SystemTime> {
    t.map(|t| match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    })
}

impl Filesystem for RevisionFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        Ok(())
    }

    fn destroy(&mut self) {}

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Ok(path) = self.child_path(parent, name) else {
            reply.error(FsError::NotFound.to_errno());
            return;
        };
        self.entry_reply(reply, &path);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Ok(path) = self.path_of(ino) else {
            reply.error(FsError::NotFound.to_errno());
            return;
        };
        self.attr_reply(reply, ino, &path);
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let result = self.block_on(async {
            let path = self.engine.path_for_ino(ino).await?;
            let vdir_target = crate::path::version_dir(self.engine.backing_root(), &path)?;

            if let Some(mode) = mode {
                let target = self.engine.resolve_for_read(&path).await;
                let target = match target {
                    Ok(p) => p,
                    Err(FsError::IsDir) => vdir_target.clone(),
                    Err(e) => return Err(e),
                };
                crate::backing::chmod(&target, mode).await?;
            }
            if uid.is_some() || gid.is_some() {
                let target = match self.engine.resolve_for_read(&path).await {
                    Ok(p) => p,
                    Err(FsError::IsDir) => vdir_target.clone(),
                    Err(e) => return Err(e),
                };
                crate::backing::chown(&target, uid, gid).await?;
            }
            if atime.is_some() || mtime.is_some() {
                let target = self.engine.resolve_for_write(&path).await?;
                crate::backing::set_times(&target, time_or_now(atime), time_or_now(mtime)).await?;
            }
            if let Some(size) = size {
                let target = self.engine.resolve_for_write(&path).await?;
                crate::backing::set_len(&target, size).await?;
            }
            self.engine.attr(&path).await
        });

        match result {
            Ok(attr) => reply.attr(&TTL, &file_attr(ino, &attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let result = self.block_on(async {
            let path = self.engine.path_for_ino(ino).await?;
            let target = self.engine.resolve_for_read(&path).await?;
            crate::backing::read_link(&target).await
        });
        match result {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let Ok(path) = self.child_path(parent, name) else {
            reply.error(FsError::NotFound.to_errno());
            return;
        };
        match self.block_on(self.engine.create_file(&path, mode)) {
            Ok(_) => self.entry_reply(reply, &path),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Ok(path) = self.child_path(parent, name) else {
            reply.error(FsError::NotFound.to_errno());
            return;
        };
        match self.block_on(self.engine.create_directory(&path, mode)) {
            Ok(()) => self.entry_reply(reply, &path),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Ok(path) = self.child_path(parent, name) else {
            reply.error(FsError::NotFound.to_errno());
            return;
        };
        let result = self.block_on(async {
            match self.engine.node_state(&path).await? {
                s if s.is_dir() => Err(FsError::IsDir),
                _ => self.engine.tombstone(&path).await,
            }
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Ok(path) = self.child_path(parent, name) else {
            reply.error(FsError::NotFound.to_errno());
            return;
        };
        let result = self.block_on(async {
            match self.engine.node_state(&path).await? {
                s if !s.is_dir() => Err(FsError::NotDir),
                _ => {
                    if !self.engine.read_directory(&path).await?.is_empty() {
                        return Err(FsError::NotEmpty);
                    }
                    self.engine.tombstone(&path).await
                }
            }
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Ok(path) = self.child_path(parent, link_name) else {
            reply.error(FsError::NotFound.to_errno());
            return;
        };
        let result = self.block_on(async {
            let rev0 = self.engine.create_file(&path, 0o777).await?;
            crate::backing::remove_file(&rev0).await?;
            crate::backing::symlink(target, &rev0).await
        });
        match result {
            Ok(()) => self.entry_reply(reply, &path),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = (|| -> Result<_, FsError> {
            let from = self.child_path(parent, name)?;
            let to = self.child_path(newparent, newname)?;
            Ok((from, to))
        })();
        let (from, to) = match result {
            Ok(v) => v,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        match self.block_on(self.engine.rename(&from, &to)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn link(&mut self, _req: &Request<'_>, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        let Ok(source) = self.path_of(ino) else {
            reply.error(FsError::NotFound.to_errno());
            return;
        };
        let Ok(dest) = self.child_path(newparent, newname) else {
            reply.error(FsError::NotFound.to_errno());
            return;
        };
        // A hard link shares the latest revision's inode, not the whole
        // version directory (that would try to hard-link a directory, which
        // POSIX forbids): create a fresh version directory for `dest` whose
        // revision 0 is hard-linked to `source`'s current revision file.
        let result = self.block_on(async {
            let source_rev = self.engine.resolve_for_read(&source).await?;
            let dest_rev0 = self.engine.create_file(&dest, 0).await?;
            crate::backing::remove_file(&dest_rev0).await?;
            crate::backing::hard_link(&source_rev, &dest_rev0).await
        });
        match result {
            Ok(()) => self.entry_reply(reply, &dest),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Ok(path) = self.path_of(ino) else {
            reply.error(FsError::NotFound.to_errno());
            return;
        };
        let writable = flags & (libc::O_WRONLY | libc::O_RDWR) != 0;
        let result: Result<tokio::fs::File, FsError> = self.block_on(async {
            let target =
                if writable { self.engine.resolve_for_write(&path).await? } else { self.engine.resolve_for_read(&path).await? };
            if writable { crate::backing::open_write(&target).await } else { crate::backing::open_read(&target).await }
        });
        match result {
            Ok(file) => reply.opened(self.open_files.insert(OpenHandle::File(file)), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};
        let read_result: Result<Vec<u8>, FsError> = self.block_on(async {
            let mut buf = vec![0u8; size as usize];
            let mut handles = self.open_files.handles.lock().await;
            let OpenHandle::File(file) = handles.get_mut(&fh).ok_or(FsError::Invalid)? else {
                return Err(FsError::Invalid);
            };
            file.seek(std::io::SeekFrom::Start(offset as u64)).await?;
            let n = file.read(&mut buf).await?;
            buf.truncate(n);
            Ok(buf)
        });
        match read_result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        use tokio::io::{AsyncSeekExt, AsyncWriteExt};
        let data = data.to_vec();
        let write_result: Result<u32, FsError> = self.block_on(async {
            let mut handles = self.open_files.handles.lock().await;
            let OpenHandle::File(file) = handles.get_mut(&fh).ok_or(FsError::Invalid)? else {
                return Err(FsError::Invalid);
            };
            file.seek(std::io::SeekFrom::Start(offset as u64)).await?;
            file.write_all(&data).await?;
            Ok(data.len() as u32)
        });
        match write_result {
            Ok(n) => reply.written(n),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        use tokio::io::AsyncWriteExt;
        let result: Result<(), FsError> = self.block_on(async {
            let mut handles = self.open_files.handles.lock().await;
            if let Some(OpenHandle::File(file)) = handles.get_mut(&fh) {
                file.flush().await?;
            }
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.open_files.remove(fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let result: Result<(), FsError> = self.block_on(async {
            let mut handles = self.open_files.handles.lock().await;
            if let Some(OpenHandle::File(file)) = handles.get_mut(&fh) {
                file.sync_all().await?;
            }
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Ok(path) = self.path_of(ino) else {
            reply.error(FsError::NotFound.to_errno());
            return;
        };
        match self.block_on(self.engine.read_directory(&path)) {
            Ok(entries) => reply.opened(self.open_dirs.insert(OpenHandle::Dir(entries)), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let dots: [(u64, FileType, &OsStr); 2] =
            [(ino, FileType::Directory, OsStr::new(".")), (ino, FileType::Directory, OsStr::new(".."))];
        let mut idx = 0i64;
        for (dot_ino, kind, name) in dots {
            if idx >= offset && reply.add(dot_ino, idx + 1, kind, name) {
                break;
            }
            idx += 1;
        }

        let added = self.open_dirs.with_dir(fh, |entries| {
            for entry in entries {
                if idx >= offset {
                    let kind = if entry.is_dir { FileType::Directory } else { FileType::RegularFile };
                    if reply.add(entry.ino, idx + 1, kind, &entry.name) {
                        break;
                    }
                }
                idx += 1;
            }
        });

        if added.is_none() {
            warn!(fh, "readdir on unknown handle");
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.open_dirs.remove(fh);
        reply.ok();
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let root = self.engine.backing_root().to_path_buf();
        let _ = ino;
        match self.block_on(crate::backing::statvfs(&root)) {
            Ok(stats) => reply.statfs(
                stats.blocks,
                stats.blocks_free,
                stats.blocks_available,
                stats.files,
                stats.files_free,
                stats.block_size as u32,
                stats.name_max,
                stats.block_size as u32,
            ),
            Err(e) => {
                error!(?e, "statfs failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Ok(path) = self.path_of(ino) else {
            reply.error(FsError::NotFound.to_errno());
            return;
        };
        let result = self.block_on(async {
            let vdir = crate::path::version_dir(self.engine.backing_root(), &path)?;
            crate::backing::access(&vdir, mask).await
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Ok(path) = self.child_path(parent, name) else {
            reply.error(FsError::NotFound.to_errno());
            return;
        };
        let result = self.block_on(async {
            let rev0 = self.engine.create_file(&path, mode).await?;
            let file = if flags & (libc::O_WRONLY | libc::O_RDWR) != 0 {
                crate::backing::open_write(&rev0).await?
            } else {
                crate::backing::open_read(&rev0).await?
            };
            let attr = self.engine.attr(&path).await?;
            let ino = self.engine.ensure_ino(&path).await;
            Ok::<_, FsError>((ino, attr, file))
        });
        match result {
            Ok((ino, attr, file)) => {
                let fh = self.open_files.insert(OpenHandle::File(file));
                reply.created(&TTL, &file_attr(ino, &attr), 0, fh, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }
}
