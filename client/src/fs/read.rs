use super::prelude::*;

use std::os::unix::fs::FileExt;

/// One line of a directory listing.
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub inode: u64,
    pub kind: FileType,
    pub name: String,
}

/// Handles the FUSE `lookup` operation.
///
/// Names are resolved against the inode tree only; the remote is never asked.
///
/// # Arguments
/// * `fs` - The shared filesystem state.
/// * `parent` - The inode of the directory to search within.
/// * `name` - The name of the entry to look up.
pub async fn lookup(fs: &RemoteFS, parent: u64, name: &OsStr) -> Result<FileAttr, FsError> {
    let node = fs.child(parent, name)?;
    Ok(fs.attr_of(&node))
}

/// Lists a folder, `.` and `..` first, then the children in their stored
/// order.
pub async fn readdir(fs: &RemoteFS, ino: u64) -> Result<Vec<DirEntry>, FsError> {
    let folder = fs.folder(ino)?;
    let parent_inode = if ino == ROOT_INODE {
        ROOT_INODE
    } else {
        folder
            .parent_id
            .as_deref()
            .and_then(|id| fs.index.read(|tree| tree.inode_of(id)))
            .unwrap_or(ROOT_INODE)
    };

    let mut entries = vec![
        DirEntry { inode: ino, kind: FileType::Directory, name: ".".to_string() },
        DirEntry { inode: parent_inode, kind: FileType::Directory, name: "..".to_string() },
    ];
    fs.index.read(|tree| {
        for child in tree.children(ino).unwrap_or_default() {
            if let Some(node) = tree.get(*child) {
                let kind = if node.is_folder() { FileType::Directory } else { FileType::RegularFile };
                entries.push(DirEntry { inode: node.inode, kind, name: node.name.clone() });
            }
        }
    });
    Ok(entries)
}

/// Handles the FUSE `open` operation.
///
/// - Read-only opens are allowed on every file.
/// - Write opens are allowed only on files that are still waiting for their
///   upload; their staging file is opened for the handle and the upload is
///   withheld until the handle is released. Remote-backed files are
///   immutable through the mount and answer `EACCES`.
///
/// # Arguments
/// * `fs` - The shared filesystem state.
/// * `ino` - The inode of the file being opened.
/// * `flags` - The open flags (`O_RDONLY`, `O_WRONLY`, `O_RDWR`, `O_TRUNC`...).
pub async fn open(fs: &RemoteFS, ino: u64, flags: i32) -> Result<u64, FsError> {
    let node = fs.node(ino)?;
    if node.is_folder() {
        return Err(FsError::IsDir);
    }
    let access_mode = flags & libc::O_ACCMODE;
    let writable = access_mode == libc::O_WRONLY || access_mode == libc::O_RDWR;

    let staged_path = fs.uploads.staged_path(ino);
    let staged = match (&staged_path, writable) {
        (Some(path), true) => {
            let truncate = flags & libc::O_TRUNC != 0;
            let path = path.clone();
            let file = tokio::task::spawn_blocking(move || {
                std::fs::OpenOptions::new().read(true).write(true).truncate(truncate).open(path)
            })
            .await
            .map_err(|e| DriveError::Shared(e.to_string()))??;
            fs.uploads.open_writer(ino);
            if truncate {
                fs.index.write(|tree| {
                    if let Some(NodeKind::File { size, .. }) = tree.get_mut(ino).map(|n| &mut n.kind) {
                        *size = 0;
                    }
                });
            }
            Some(Arc::new(file))
        }
        (Some(path), false) => Some(Arc::new(std::fs::File::open(path)?)),
        (None, true) => {
            debug!(ino, name = %node.name, "write open of a remote-backed file refused");
            return Err(FsError::Access);
        }
        (None, false) => None,
    };

    let fh = fs.allocate_fh();
    fs.open_files.insert(fh, OpenFile { inode: ino, staged, writable });
    debug!(ino, fh, writable, "opened");
    Ok(fh)
}

/// Handles the FUSE `read` operation.
///
/// Files still waiting for their upload are read from their staging file;
/// everything else goes through the chunk cache.
///
/// # Arguments
/// * `fs` - The shared filesystem state.
/// * `ino` - The inode of the file to read.
/// * `fh` - The handle returned by `open` or `create`.
/// * `offset` - The byte offset in the file to start reading from.
/// * `size` - The maximum number of bytes to read.
pub async fn read(fs: &RemoteFS, ino: u64, fh: u64, offset: u64, size: u32) -> Result<Bytes, FsError> {
    let node = fs.node(ino)?;
    if node.is_folder() {
        return Err(FsError::IsDir);
    }

    let handle = fs.open_files.get(&fh).and_then(|h| h.staged.clone());
    if let Some(file) = handle {
        return read_staged(file, offset, size).await;
    }
    if let Some(path) = fs.uploads.staged_path(ino) {
        let file = Arc::new(std::fs::File::open(path)?);
        return read_staged(file, offset, size).await;
    }

    let remote = RemoteFS::remote_file(&node).ok_or(FsError::NotFound)?;
    Ok(fs.cache.read(&remote, offset, u64::from(size)).await?)
}

async fn read_staged(file: Arc<std::fs::File>, offset: u64, size: u32) -> Result<Bytes, FsError> {
    let bytes = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    })
    .await
    .map_err(|e| DriveError::Shared(e.to_string()))??;
    Ok(Bytes::from(bytes))
}
