//! The metadata index: the inode tree behind a lock, plus its durable snapshot.
//!
//! All access goes through [`MetadataIndex::read`] and [`MetadataIndex::write`],
//! which take closures. The lock is a `parking_lot::RwLock` and can therefore
//! never be held across an `.await`.

mod node;
mod tree;

pub use node::{DEFAULT_FILE_MODE, DEFAULT_FOLDER_MODE, Node, NodeKind, ROOT_INODE};
pub use tree::{InodeTree, TreeSnapshot};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::DriveError;
use crate::persist::{self, SaveScheduler};

pub const SNAPSHOT_FILE: &str = "inode_tree.json";

pub struct MetadataIndex {
    tree: RwLock<InodeTree>,
    saver: Option<SaveScheduler>,
    path: Option<PathBuf>,
}

impl MetadataIndex {
    /// An index that is never written to disk.
    pub fn in_memory(tree: InodeTree) -> Arc<Self> {
        Arc::new(Self { tree: RwLock::new(tree), saver: None, path: None })
    }

    /// An index saved to `path` in the background after every mutation.
    /// Must be called from within a Tokio runtime.
    pub fn persistent(tree: InodeTree, path: PathBuf) -> Arc<Self> {
        Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let weak = weak.clone();
            let saver = SaveScheduler::spawn(path.clone(), move || {
                weak.upgrade().map(|index| index.snapshot_bytes())
            });
            Self { tree: RwLock::new(tree), saver: Some(saver), path: Some(path) }
        })
    }

    /// Loads a snapshot. Any failure means a cold start is required.
    pub async fn load_snapshot(path: &Path) -> Result<InodeTree, DriveError> {
        let snapshot: TreeSnapshot = persist::load_json(path)
            .await?
            .ok_or_else(|| DriveError::Snapshot(format!("{} does not exist", path.display())))?;
        InodeTree::from_snapshot(snapshot)
    }

    pub fn read<R>(&self, f: impl FnOnce(&InodeTree) -> R) -> R {
        f(&self.tree.read())
    }

    /// Runs a mutation and schedules a snapshot save.
    pub fn write<R>(&self, f: impl FnOnce(&mut InodeTree) -> R) -> R {
        let result = f(&mut self.tree.write());
        self.request_save();
        result
    }

    /// Swaps in a whole new tree, as produced by a full scan.
    pub fn replace(&self, tree: InodeTree) {
        *self.tree.write() = tree;
        self.request_save();
    }

    pub fn get(&self, inode: u64) -> Option<Node> {
        self.tree.read().get(inode).cloned()
    }

    pub fn get_by_remote_id(&self, remote_id: &str) -> Option<Node> {
        self.tree.read().get_by_remote_id(remote_id).cloned()
    }

    pub fn request_save(&self) {
        if let Some(saver) = &self.saver {
            saver.request();
        }
    }

    /// Writes the snapshot now, bypassing the background saver.
    pub async fn save_now(&self) -> Result<(), DriveError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = self.snapshot_bytes()?;
        persist::write_atomic(path, &bytes).await?;
        Ok(())
    }

    fn snapshot_bytes(&self) -> Result<Vec<u8>, DriveError> {
        let snapshot = self.tree.read().to_snapshot();
        Ok(serde_json::to_vec(&snapshot)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn remote_folder(id: &str, parent: &str, name: &str) -> Node {
        Node {
            inode: 0,
            remote_id: Some(id.into()),
            parent_id: Some(parent.into()),
            name: name.into(),
            ctime: 0,
            mtime: 0,
            editable: true,
            mode: DEFAULT_FOLDER_MODE,
            kind: NodeKind::Folder { children: vec![] },
        }
    }

    #[tokio::test]
    async fn missing_snapshot_requires_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let result = MetadataIndex::load_snapshot(&dir.path().join(SNAPSHOT_FILE)).await;
        assert!(matches!(result, Err(DriveError::Snapshot(_))));
    }

    #[tokio::test]
    async fn corrupt_snapshot_requires_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SNAPSHOT_FILE);
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(MetadataIndex::load_snapshot(&path).await.is_err());
    }

    #[tokio::test]
    async fn mutations_are_saved_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SNAPSHOT_FILE);
        let index = MetadataIndex::persistent(InodeTree::new(Some("root".into())), path.clone());

        let docs = index.write(|t| t.insert(remote_folder("f-docs", "root", "docs")));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let loaded = MetadataIndex::load_snapshot(&path).await.unwrap();
        assert_eq!(loaded.lookup_child(ROOT_INODE, "docs"), Some(docs));
        assert_eq!(loaded.current_largest_inode(), docs);
    }

    #[tokio::test]
    async fn save_now_writes_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SNAPSHOT_FILE);
        let index = MetadataIndex::persistent(InodeTree::new(Some("root".into())), path.clone());
        index.write(|t| t.insert(remote_folder("f-a", "root", "a")));
        index.save_now().await.unwrap();
        let loaded = MetadataIndex::load_snapshot(&path).await.unwrap();
        assert_eq!(loaded.len(), 2);
    }
}
