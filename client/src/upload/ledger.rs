//! Durable list of files waiting to be uploaded (`pending_uploads.json`).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::DriveError;
use crate::persist::{self, SaveScheduler};

pub const LEDGER_FILE: &str = "pending_uploads.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUpload {
    /// Staging file name under `upload/`.
    pub cache: String,
    /// Location of the resumable session, once one exists.
    pub location: Option<String>,
    /// Set when the last writer closed the file.
    pub released: bool,
    pub parent_id: String,
    pub name: String,
}

/// Content address of a staged file: MD5 of parent id and name.
pub fn staging_name(parent_id: &str, name: &str) -> String {
    format!("{:x}", md5::compute(format!("{parent_id}{name}")))
}

pub struct UploadLedger {
    entries: Mutex<BTreeMap<u64, PendingUpload>>,
    saver: Option<SaveScheduler>,
    path: Option<PathBuf>,
}

impl UploadLedger {
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self { entries: Mutex::new(BTreeMap::new()), saver: None, path: None })
    }

    /// Loads the ledger at `path` (empty when absent) and keeps it saved.
    /// Must be called from within a Tokio runtime.
    pub async fn open(path: PathBuf) -> Result<Arc<Self>, DriveError> {
        let entries: BTreeMap<u64, PendingUpload> = persist::load_json(&path).await?.unwrap_or_default();
        Ok(Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let weak = weak.clone();
            let saver = SaveScheduler::spawn(path.clone(), move || {
                weak.upgrade().map(|ledger| ledger.to_bytes())
            });
            Self { entries: Mutex::new(entries), saver: Some(saver), path: Some(path) }
        }))
    }

    fn to_bytes(&self) -> Result<Vec<u8>, DriveError> {
        Ok(serde_json::to_vec(&*self.entries.lock())?)
    }

    fn changed(&self) {
        if let Some(saver) = &self.saver {
            saver.request();
        }
    }

    pub fn get(&self, inode: u64) -> Option<PendingUpload> {
        self.entries.lock().get(&inode).cloned()
    }

    pub fn contains(&self, inode: u64) -> bool {
        self.entries.lock().contains_key(&inode)
    }

    pub fn insert(&self, inode: u64, entry: PendingUpload) {
        self.entries.lock().insert(inode, entry);
        self.changed();
    }

    /// Applies `f` to the entry of `inode`. Returns false when there is none.
    pub fn update(&self, inode: u64, f: impl FnOnce(&mut PendingUpload)) -> bool {
        let updated = match self.entries.lock().get_mut(&inode) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        };
        if updated {
            self.changed();
        }
        updated
    }

    pub fn remove(&self, inode: u64) -> Option<PendingUpload> {
        let removed = self.entries.lock().remove(&inode);
        if removed.is_some() {
            self.changed();
        }
        removed
    }

    pub fn entries(&self) -> Vec<(u64, PendingUpload)> {
        self.entries.lock().iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    pub fn is_tracked(&self, cache: &str) -> bool {
        self.owner_of(cache).is_some()
    }

    /// Inode whose pending upload is staged under `cache`.
    pub fn owner_of(&self, cache: &str) -> Option<u64> {
        self.entries.lock().iter().find(|(_, e)| e.cache == cache).map(|(inode, _)| *inode)
    }

    pub async fn save_now(&self) -> Result<(), DriveError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = self.to_bytes()?;
        persist::write_atomic(path, &bytes).await?;
        Ok(())
    }
}
