//! The FUSE adapter.
//!
//! Each kernel callback is implemented as an async function over a shared
//! [`RemoteFS`] in its own sub-module; [`FsWrapper`] is the `fuser::Filesystem`
//! that blocks on them and turns an [`FsError`] into an errno.

mod attr;
mod create;
mod delete;
mod prelude;
mod read;
mod rename;
mod write;
mod xattr;

pub use attr::{access, getattr, setattr, statfs, SetAttr, StatFs};
pub use create::{create, mkdir};
pub use delete::{rmdir, unlink};
pub use read::{lookup, open, read, readdir, DirEntry};
pub use rename::rename;
pub use write::{flush, release, write};

use std::ffi::OsStr;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use nix::unistd::{getgid, getuid};
use tokio::runtime::Handle;
use tracing::debug;

use crate::api_client::RemoteStore;
use crate::cache::{ChunkCache, RemoteFile};
use crate::error::FsError;
use crate::metadata::{MetadataIndex, Node, NodeKind};
use crate::upload::UploadEngine;

/// Generation reported with every entry; inodes are never reused while mounted.
pub const GENERATION: u64 = 0;

/// An open file handle.
#[derive(Debug, Clone)]
pub struct OpenFile {
    pub inode: u64,
    /// Staging file, for handles on files that are not uploaded yet.
    pub staged: Option<Arc<File>>,
    pub writable: bool,
}

/// Shared state of the mounted filesystem.
pub struct RemoteFS {
    pub(crate) index: Arc<MetadataIndex>,
    pub(crate) cache: Arc<ChunkCache>,
    pub(crate) uploads: Arc<UploadEngine>,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) open_files: DashMap<u64, OpenFile>,
    next_fh: AtomicU64,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) ttl: Duration,
}

impl RemoteFS {
    /// # Arguments
    /// * `index` - The inode tree every operation resolves against.
    /// * `cache` - Serves reads of remote-backed files.
    /// * `uploads` - Receives files created through the mount.
    /// * `remote` - Used directly for folder creation, renames and trash.
    /// * `ttl` - How long the kernel may cache attributes and entries.
    pub fn new(
        index: Arc<MetadataIndex>,
        cache: Arc<ChunkCache>,
        uploads: Arc<UploadEngine>,
        remote: Arc<dyn RemoteStore>,
        ttl: Duration,
    ) -> Self {
        let (uid, gid) = (getuid().as_raw(), getgid().as_raw());
        Self {
            index,
            cache,
            uploads,
            remote,
            open_files: DashMap::new(),
            next_fh: AtomicU64::new(1),
            uid,
            gid,
            ttl,
        }
    }

    pub(crate) fn allocate_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn node(&self, inode: u64) -> Result<Node, FsError> {
        self.index.get(inode).ok_or(FsError::NotFound)
    }

    /// Resolves `inode` and checks that it is a folder.
    pub(crate) fn folder(&self, inode: u64) -> Result<Node, FsError> {
        let node = self.node(inode)?;
        if !node.is_folder() {
            return Err(FsError::NotDir);
        }
        Ok(node)
    }

    /// Looks up `name` inside folder `parent`.
    pub(crate) fn child(&self, parent: u64, name: &OsStr) -> Result<Node, FsError> {
        self.folder(parent)?;
        let name = name_str(name)?;
        self.index
            .read(|tree| tree.lookup_child(parent, name).and_then(|ino| tree.get(ino).cloned()))
            .ok_or(FsError::NotFound)
    }

    pub(crate) fn attr_of(&self, node: &Node) -> FileAttr {
        let (kind, nlink) = match node.kind {
            NodeKind::Folder { .. } => (FileType::Directory, 2),
            NodeKind::File { .. } => (FileType::RegularFile, 1),
        };
        let size = node.size();
        let mtime = millis_to_time(node.mtime);
        FileAttr {
            ino: node.inode,
            size,
            blocks: size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: millis_to_time(node.ctime),
            kind,
            perm: (node.mode & 0o7777) as u16,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    /// Read context of a remote-backed file; `None` while it is only local.
    pub(crate) fn remote_file(node: &Node) -> Option<RemoteFile> {
        match &node.kind {
            NodeKind::File { size, download_url } => node.remote_id.as_ref().map(|id| RemoteFile {
                remote_id: id.clone(),
                size: *size,
                download_url: download_url.clone(),
            }),
            NodeKind::Folder { .. } => None,
        }
    }
}

pub(crate) fn name_str(name: &OsStr) -> Result<&str, FsError> {
    name.to_str().ok_or(FsError::Invalid)
}

pub(crate) fn millis_to_time(ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
}

pub(crate) fn time_to_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// The `fuser::Filesystem` face of a [`RemoteFS`].
///
/// FUSE callbacks arrive on a plain thread; each one blocks on the runtime
/// that also runs the background sync and upload tasks.
pub struct FsWrapper {
    fs: Arc<RemoteFS>,
    runtime: Handle,
}

impl FsWrapper {
    pub fn new(fs: Arc<RemoteFS>, runtime: Handle) -> Self {
        Self { fs, runtime }
    }
}

impl Filesystem for FsWrapper {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.runtime.block_on(lookup(&self.fs, parent, name)) {
            Ok(attr) => reply.entry(&self.fs.ttl, &attr, GENERATION),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        match self.runtime.block_on(getattr(&self.fs, ino)) {
            Ok(attr) => reply.attr(&self.fs.ttl, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let mtime = mtime.map(|t| match t {
            TimeOrNow::SpecificTime(time) => time,
            TimeOrNow::Now => SystemTime::now(),
        });
        let changes = SetAttr { mode, size, mtime };
        match self.runtime.block_on(setattr(&self.fs, ino, changes)) {
            Ok(attr) => reply.attr(&self.fs.ttl, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, umask: u32, reply: ReplyEntry) {
        match self.runtime.block_on(mkdir(&self.fs, parent, name, mode & !umask)) {
            Ok(attr) => reply.entry(&self.fs.ttl, &attr, GENERATION),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.runtime.block_on(unlink(&self.fs, parent, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.runtime.block_on(rmdir(&self.fs, parent, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
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
        match self.runtime.block_on(rename(&self.fs, parent, name, newparent, newname)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.runtime.block_on(open(&self.fs, ino, flags)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.runtime.block_on(read(&self.fs, ino, fh, offset as u64, size)) {
            Ok(bytes) => reply.data(&bytes),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.runtime.block_on(write(&self.fs, ino, fh, offset as u64, data)) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.runtime.block_on(flush(&self.fs, ino, fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.runtime.block_on(release(&self.fs, ino, fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let entries = match self.runtime.block_on(readdir(&self.fs, ino)) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        for (i, entry) in entries.into_iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(entry.inode, (i + 1) as i64, entry.kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let s = statfs(&self.fs);
        reply.statfs(s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize);
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        xattr::setxattr(ino, name, reply);
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, _size: u32, reply: ReplyXattr) {
        xattr::getxattr(ino, name, reply);
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, size: u32, reply: ReplyXattr) {
        xattr::listxattr(size, reply);
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        match access(&self.fs, ino) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        match self.runtime.block_on(create(&self.fs, parent, name, mode & !umask)) {
            Ok((attr, fh)) => reply.created(&self.fs.ttl, &attr, GENERATION, fh, 0),
            Err(e) => {
                debug!(parent, ?name, error = %e, "create failed");
                reply.error(e.errno())
            }
        }
    }
}
