use super::prelude::*;

use super::delete::{remove_file, remove_folder};
use crate::retry::{RetryPolicy, with_retries};

/// Handles the FUSE `rename` operation (e.g., `mv old.txt dir/new.txt`).
///
/// # Remote-backed entries
/// One metadata patch renames the object and, when the folder changes, swaps
/// its parent. The tree is updated only after the remote accepted the patch.
///
/// # Pending files
/// Nothing exists remotely yet: the node is renamed and moved locally and the
/// pending upload is pointed at the new destination.
///
/// An existing target is replaced: a file target is unlinked, a folder target
/// must be empty.
///
/// # Arguments
/// * `fs` - The shared filesystem state.
/// * `parent` - The inode of the source directory.
/// * `name` - The name of the source entry.
/// * `newparent` - The inode of the destination directory.
/// * `newname` - The new name of the entry.
pub async fn rename(
    fs: &RemoteFS,
    parent: u64,
    name: &OsStr,
    newparent: u64,
    newname: &OsStr,
) -> Result<(), FsError> {
    let source = fs.child(parent, name)?;
    let destination = fs.folder(newparent)?;
    let new_name = name_str(newname)?.to_string();
    let new_parent_id = destination.remote_id.clone().ok_or(FsError::Access)?;
    let old_parent_id = source.parent_id.clone();

    if source.is_folder() && moves_into_itself(fs, &source, newparent) {
        return Err(FsError::Invalid);
    }

    match fs.child(newparent, newname) {
        Ok(target) if target.inode == source.inode => return Ok(()),
        Ok(target) => match (source.is_folder(), target.is_folder()) {
            (false, false) => remove_file(fs, &target).await,
            (true, true) => remove_folder(fs, &target).await?,
            (true, false) => return Err(FsError::NotDir),
            (false, true) => return Err(FsError::IsDir),
        },
        Err(FsError::NotFound) => {}
        Err(e) => return Err(e),
    }

    let moved = old_parent_id.as_deref() != Some(new_parent_id.as_str());
    if let Some(remote_id) = &source.remote_id {
        let patch = ObjectPatch {
            title: (source.name != new_name).then(|| new_name.clone()),
            add_parent: moved.then(|| new_parent_id.clone()),
            remove_parent: if moved { old_parent_id.clone() } else { None },
        };
        let remote = fs.remote.as_ref();
        with_retries(remote, &RetryPolicy::foreground(), "rename", || remote.patch_object(remote_id, &patch)).await?;
    } else {
        fs.uploads.relocate(source.inode, &new_parent_id, &new_name).await?;
    }

    fs.index.write(|tree| {
        tree.rename(source.inode, &new_name);
        if moved {
            tree.reparent(source.inode, &new_parent_id);
        }
    });
    info!(inode = source.inode, from = %source.name, to = %new_name, moved, "renamed");
    Ok(())
}

/// True when `target` is `folder` itself or lies below it.
fn moves_into_itself(fs: &RemoteFS, folder: &Node, target: u64) -> bool {
    fs.index.read(|tree| {
        let mut current = Some(target);
        while let Some(inode) = current {
            if inode == folder.inode {
                return true;
            }
            if inode == ROOT_INODE {
                return false;
            }
            current = tree
                .get(inode)
                .and_then(|n| n.parent_id.as_deref())
                .and_then(|id| tree.inode_of(id));
        }
        false
    })
}
