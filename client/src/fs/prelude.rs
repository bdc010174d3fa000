//! Common imports of the `fs` sub-modules.

pub use fuser::{FileAttr, FileType};

pub use std::ffi::OsStr;
pub use std::sync::Arc;
pub use std::time::SystemTime;

pub use bytes::Bytes;
pub use tracing::{debug, info, warn};

pub use crate::api_client::ObjectPatch;
pub use crate::cache::now_millis;
pub use crate::error::{DriveError, FsError};
pub use crate::metadata::{Node, NodeKind, ROOT_INODE};

pub(crate) use super::name_str;
pub use super::{OpenFile, RemoteFS};
