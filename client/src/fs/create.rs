use super::prelude::*;

use crate::retry::{RetryPolicy, with_retries};

/// Remote id of a folder new entries can be created in.
fn destination(fs: &RemoteFS, parent: u64, name: &OsStr) -> Result<String, FsError> {
    let folder = fs.folder(parent)?;
    match fs.child(parent, name) {
        Ok(_) => return Err(FsError::Exists),
        Err(FsError::NotFound) => {}
        Err(e) => return Err(e),
    }
    folder.remote_id.ok_or(FsError::Access)
}

/// Handles the FUSE `create` operation (e.g., `touch file.txt` or `> file.txt`).
///
/// The file exists only locally until its last writer releases it:
/// 1. A local node without a remote id is inserted into the tree.
/// 2. An empty staging file is created and recorded as a pending upload.
/// 3. A writable handle on the staging file is returned.
///
/// # Arguments
/// * `fs` - The shared filesystem state.
/// * `parent` - The inode of the parent directory.
/// * `name` - The name of the file to create.
/// * `mode` - Permission bits, umask already applied.
pub async fn create(fs: &RemoteFS, parent: u64, name: &OsStr, mode: u32) -> Result<(FileAttr, u64), FsError> {
    let parent_id = destination(fs, parent, name)?;
    let name = name_str(name)?;

    let mode = libc::S_IFREG as u32 | (mode & 0o7777);
    let node = Node::local_file(Some(parent_id.clone()), name, now_millis(), mode);
    let inode = fs.index.write(|tree| tree.insert(node));

    let path = match fs.uploads.stage(inode, &parent_id, name).await {
        Ok(path) => path,
        Err(e) => {
            warn!(inode, name, error = %e, "cannot stage new file");
            fs.index.write(|tree| tree.delete(inode));
            return Err(e.into());
        }
    };
    let file = tokio::fs::OpenOptions::new().read(true).write(true).open(&path).await?;
    let file = Arc::new(file.into_std().await);
    fs.uploads.open_writer(inode);

    let fh = fs.allocate_fh();
    fs.open_files.insert(fh, OpenFile { inode, staged: Some(file), writable: true });
    info!(inode, name, parent_id = %parent_id, "created local file");

    let node = fs.node(inode)?;
    Ok((fs.attr_of(&node), fh))
}

/// Handles the FUSE `mkdir` operation.
///
/// Folders are created remotely first and enter the tree with the identity
/// the remote assigned.
///
/// # Arguments
/// * `fs` - The shared filesystem state.
/// * `parent` - The inode of the parent directory.
/// * `name` - The name of the directory to create.
/// * `mode` - Permission bits, umask already applied.
pub async fn mkdir(fs: &RemoteFS, parent: u64, name: &OsStr, mode: u32) -> Result<FileAttr, FsError> {
    let parent_id = destination(fs, parent, name)?;
    let name = name_str(name)?;

    let remote = fs.remote.as_ref();
    let object = with_retries(remote, &RetryPolicy::foreground(), "insert folder", || {
        remote.insert_folder(&parent_id, name)
    })
    .await?;

    let mut node = Node::from_remote(&object);
    node.mode = libc::S_IFDIR as u32 | (mode & 0o7777);
    let inode = fs.index.write(|tree| tree.insert(node));
    info!(inode, name, remote_id = %object.id, "created folder");

    let node = fs.node(inode)?;
    Ok(fs.attr_of(&node))
}
