use serde::{Deserialize, Serialize};

use crate::api_client::RemoteObject;

/// Inode of the mount root.
pub const ROOT_INODE: u64 = 1;

pub const DEFAULT_FILE_MODE: u32 = libc::S_IFREG as u32 | 0o777;
pub const DEFAULT_FOLDER_MODE: u32 = libc::S_IFDIR as u32 | 0o777;

/// One filesystem-visible entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub inode: u64,
    /// Absent for a file that has not been uploaded yet.
    pub remote_id: Option<String>,
    /// Remote id of the parent folder. Absent only for the root.
    pub parent_id: Option<String>,
    pub name: String,
    /// Milliseconds since the epoch.
    pub ctime: i64,
    pub mtime: i64,
    pub editable: bool,
    pub mode: u32,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodeKind {
    File {
        size: u64,
        download_url: Option<String>,
    },
    Folder {
        children: Vec<u64>,
    },
}

impl Node {
    pub fn root(remote_id: Option<String>) -> Self {
        Self {
            inode: ROOT_INODE,
            remote_id,
            parent_id: None,
            name: String::new(),
            ctime: 0,
            mtime: 0,
            editable: true,
            mode: DEFAULT_FOLDER_MODE,
            kind: NodeKind::Folder { children: Vec::new() },
        }
    }

    /// A file created locally, waiting for its first upload.
    pub fn local_file(parent_id: Option<String>, name: &str, now_ms: i64, mode: u32) -> Self {
        Self {
            inode: 0,
            remote_id: None,
            parent_id,
            name: name.to_string(),
            ctime: now_ms,
            mtime: now_ms,
            editable: true,
            mode,
            kind: NodeKind::File { size: 0, download_url: None },
        }
    }

    /// Builds a node from a remote listing row. The inode is assigned on insert.
    pub fn from_remote(object: &RemoteObject) -> Self {
        let kind = if object.is_folder() {
            NodeKind::Folder { children: Vec::new() }
        } else {
            NodeKind::File {
                size: object.file_size.unwrap_or(0),
                download_url: object.download_url.clone(),
            }
        };
        let mode = if object.is_folder() { DEFAULT_FOLDER_MODE } else { DEFAULT_FILE_MODE };
        Self {
            inode: 0,
            remote_id: Some(object.id.clone()),
            parent_id: object.parent_id().map(str::to_string),
            name: object.display_name(),
            ctime: object.created_date.timestamp_millis(),
            mtime: object.modified_date.timestamp_millis(),
            editable: object.editable,
            mode,
            kind,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.kind, NodeKind::Folder { .. })
    }

    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File { size, .. } => *size,
            NodeKind::Folder { .. } => 4096,
        }
    }

    pub fn children(&self) -> Option<&[u64]> {
        match &self.kind {
            NodeKind::Folder { children } => Some(children),
            NodeKind::File { .. } => None,
        }
    }
}
