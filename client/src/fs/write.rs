use super::prelude::*;

use std::os::unix::fs::FileExt;

/// Handles the FUSE `write` operation.
///
/// Writes land in the staging file behind the handle; the node's size and
/// modification time follow.
///
/// # Arguments
/// * `fs` - The shared filesystem state.
/// * `ino` - The inode being written.
/// * `fh` - A writable handle returned by `create` or `open`.
/// * `offset` - The byte offset to write at.
/// * `data` - The bytes to write.
pub async fn write(fs: &RemoteFS, ino: u64, fh: u64, offset: u64, data: &[u8]) -> Result<u32, FsError> {
    let handle = fs.open_files.get(&fh).map(|h| h.clone()).ok_or(FsError::BadHandle)?;
    let file = match (handle.writable, handle.staged) {
        (true, Some(file)) if handle.inode == ino => file,
        _ => return Err(FsError::BadHandle),
    };

    let bytes = data.to_vec();
    let len = bytes.len() as u64;
    tokio::task::spawn_blocking(move || file.write_all_at(&bytes, offset))
        .await
        .map_err(|e| DriveError::Shared(e.to_string()))??;

    let now = now_millis();
    fs.index.write(|tree| {
        if let Some(node) = tree.get_mut(ino) {
            node.mtime = now;
            if let NodeKind::File { size, .. } = &mut node.kind {
                *size = (*size).max(offset + len);
            }
        }
    });
    Ok(data.len() as u32)
}

/// Handles the FUSE `flush` operation. Data is already in the staging file.
pub async fn flush(fs: &RemoteFS, _ino: u64, fh: u64) -> Result<(), FsError> {
    if !fs.open_files.contains_key(&fh) {
        return Err(FsError::BadHandle);
    }
    Ok(())
}

/// Handles the FUSE `release` operation.
///
/// When the last writable handle of a pending file closes, the file is
/// handed to the upload engine.
pub async fn release(fs: &RemoteFS, ino: u64, fh: u64) -> Result<(), FsError> {
    let Some((_, handle)) = fs.open_files.remove(&fh) else {
        return Ok(());
    };
    if !handle.writable || !fs.uploads.is_pending(ino) {
        return Ok(());
    }
    debug!(ino, fh, "writer released");
    fs.uploads.release(ino);
    Ok(())
}
