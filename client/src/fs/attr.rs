use super::prelude::*;

/// Attribute changes requested through `setattr`.
#[derive(Debug, Clone, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub size: Option<u64>,
    pub mtime: Option<SystemTime>,
}

/// Values reported by `statfs`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// The remote quota is not known locally; this many blocks are advertised.
const ADVERTISED_BLOCKS: u64 = 1_000_000;

/// FUSE `getattr`: attributes straight from the inode tree.
pub async fn getattr(fs: &RemoteFS, ino: u64) -> Result<FileAttr, FsError> {
    let node = fs.node(ino)?;
    Ok(fs.attr_of(&node))
}

/// FUSE `setattr`.
///
/// Changes are recorded locally and never sent to the remote:
/// - **mode** replaces the permission bits, keeping the file type.
/// - **mtime** replaces the modification time.
/// - **size** truncates or extends the staging file of a file that has not
///   been uploaded yet. A remote-backed file cannot change size through the
///   mount (`EACCES`) unless the size requested is its current one.
///
/// # Arguments
/// * `fs` - The shared filesystem state.
/// * `ino` - The inode to modify.
/// * `changes` - The requested changes; `None` fields are left alone.
pub async fn setattr(fs: &RemoteFS, ino: u64, changes: SetAttr) -> Result<FileAttr, FsError> {
    let node = fs.node(ino)?;

    if let Some(new_size) = changes.size {
        if node.is_folder() {
            return Err(FsError::IsDir);
        }
        if new_size != node.size() {
            let path = fs.uploads.staged_path(ino).ok_or(FsError::Access)?;
            let file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
            file.set_len(new_size).await?;
            fs.uploads.touch(ino);
            debug!(ino, new_size, "staged file resized");
        }
    }

    let updated = fs.index.write(|tree| {
        let node = tree.get_mut(ino)?;
        if let Some(mode) = changes.mode {
            node.mode = (node.mode & libc::S_IFMT as u32) | (mode & 0o7777);
        }
        if let Some(mtime) = changes.mtime {
            node.mtime = super::time_to_millis(mtime);
        }
        if let (Some(new_size), NodeKind::File { size, .. }) = (changes.size, &mut node.kind) {
            *size = new_size;
        }
        Some(node.clone())
    });
    let node = updated.ok_or(FsError::NotFound)?;
    Ok(fs.attr_of(&node))
}

/// FUSE `statfs`. Block size is half a chunk.
pub fn statfs(fs: &RemoteFS) -> StatFs {
    let bsize = u32::try_from(fs.cache.chunk_size() / 2).unwrap_or(u32::MAX);
    StatFs {
        blocks: ADVERTISED_BLOCKS,
        bfree: ADVERTISED_BLOCKS,
        bavail: ADVERTISED_BLOCKS,
        files: ADVERTISED_BLOCKS,
        ffree: ADVERTISED_BLOCKS,
        bsize,
        namelen: 255,
        frsize: bsize,
    }
}

/// FUSE `access`: every indexed inode is accessible.
pub fn access(fs: &RemoteFS, ino: u64) -> Result<(), FsError> {
    match fs.index.get(ino) {
        Some(_) => Ok(()),
        None => Err(FsError::Access),
    }
}
