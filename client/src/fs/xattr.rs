use fuser::{ReplyEmpty, ReplyXattr};
use tracing::trace;

use super::prelude::OsStr;

/// Handles the `getxattr` request.
///
/// No entry carries extended attributes; the kernel is told the attribute
/// does not exist (`ENOATTR` on macOS, `ENODATA` on Linux).
pub fn getxattr(ino: u64, name: &OsStr, reply: ReplyXattr) {
    trace!(ino, ?name, "getxattr");
    #[cfg(target_os = "macos")]
    reply.error(libc::ENOATTR);

    #[cfg(not(target_os = "macos"))]
    reply.error(libc::ENODATA);
}

/// Handles the `setxattr` request.
///
/// Accepted and dropped, so that desktop file managers copying tags or
/// quarantine flags do not fail the whole copy.
pub fn setxattr(ino: u64, name: &OsStr, reply: ReplyEmpty) {
    trace!(ino, ?name, "setxattr ignored");
    reply.ok();
}

/// Handles the `listxattr` request with an empty list.
pub fn listxattr(size: u32, reply: ReplyXattr) {
    if size == 0 {
        reply.size(0);
    } else {
        reply.data(&[]);
    }
}
