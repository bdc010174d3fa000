use super::prelude::*;

use crate::retry::{RetryPolicy, with_retries};

/// Handles the FUSE `unlink` operation.
///
/// The node leaves the tree at once. A file that was never uploaded just
/// drops its pending upload; a remote-backed file is moved to the remote
/// trash, and a failure to do so is logged but does not fail the call.
///
/// # Arguments
/// * `fs` - The shared filesystem state.
/// * `parent` - The inode of the directory holding the file.
/// * `name` - The name of the file to remove.
pub async fn unlink(fs: &RemoteFS, parent: u64, name: &OsStr) -> Result<(), FsError> {
    let node = fs.child(parent, name)?;
    if node.is_folder() {
        return Err(FsError::IsDir);
    }
    remove_file(fs, &node).await;
    Ok(())
}

/// Removes a file node, its pending upload and its remote copy.
pub(crate) async fn remove_file(fs: &RemoteFS, node: &Node) {
    fs.index.write(|tree| tree.delete(node.inode));
    fs.uploads.discard(node.inode).await;

    if let Some(remote_id) = &node.remote_id {
        fs.cache.forget(remote_id);
        let remote = fs.remote.as_ref();
        let trashed = with_retries(remote, &RetryPolicy::foreground(), "trash file", || {
            remote.trash_object(remote_id)
        })
        .await;
        match trashed {
            Ok(()) => info!(inode = node.inode, name = %node.name, "file trashed"),
            Err(e) if e.is_not_found() => debug!(remote_id = %remote_id, "file already gone remotely"),
            Err(e) => warn!(remote_id = %remote_id, error = %e, "cannot trash file"),
        }
    } else {
        info!(inode = node.inode, name = %node.name, "local file removed before upload");
    }
}

/// Handles the FUSE `rmdir` operation. Only empty folders are removed; the
/// folder is trashed remotely first.
///
/// # Arguments
/// * `fs` - The shared filesystem state.
/// * `parent` - The inode of the directory holding the folder.
/// * `name` - The name of the folder to remove.
pub async fn rmdir(fs: &RemoteFS, parent: u64, name: &OsStr) -> Result<(), FsError> {
    let node = fs.child(parent, name)?;
    remove_folder(fs, &node).await
}

pub(crate) async fn remove_folder(fs: &RemoteFS, node: &Node) -> Result<(), FsError> {
    match node.children() {
        None => return Err(FsError::NotDir),
        Some(children) if !children.is_empty() => return Err(FsError::NotEmpty),
        Some(_) => {}
    }
    if let Some(remote_id) = &node.remote_id {
        let remote = fs.remote.as_ref();
        let trashed = with_retries(remote, &RetryPolicy::foreground(), "trash folder", || {
            remote.trash_object(remote_id)
        })
        .await;
        match trashed {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(remote_id = %remote_id, "folder already gone remotely"),
            Err(e) => return Err(e.into()),
        }
    }
    fs.index.write(|tree| tree.delete(node.inode));
    info!(inode = node.inode, name = %node.name, "folder removed");
    Ok(())
}
