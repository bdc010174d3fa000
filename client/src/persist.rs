//! Durable JSON state under `data/`.
//!
//! Every state file is replaced atomically (write to a sibling temp file,
//! then rename) and saves are coalesced: while a save is running, any number
//! of further requests collapse into exactly one follow-up save.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;

use crate::error::DriveError;

/// Writes `bytes` to `path` so that readers see either the old or the new content.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp-{:08x}", rand::random::<u32>()));
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

pub async fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), DriveError> {
    let bytes = serde_json::to_vec(value)?;
    write_atomic(path, &bytes).await?;
    Ok(())
}

/// Loads a JSON state file. A missing file yields `Ok(None)`.
pub async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, DriveError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Background saver for one state file.
///
/// The snapshot closure is called on the saver task; returning `None` means the
/// owner is gone and the task exits.
pub struct SaveScheduler {
    notify: Arc<Notify>,
}

impl SaveScheduler {
    /// Spawns the saver task. Must be called from within a Tokio runtime.
    pub fn spawn<F>(path: PathBuf, snapshot: F) -> Self
    where
        F: Fn() -> Option<Result<Vec<u8>, DriveError>> + Send + Sync + 'static,
    {
        let notify = Arc::new(Notify::new());
        let wakeups = notify.clone();
        tokio::spawn(async move {
            loop {
                wakeups.notified().await;
                let Some(bytes) = snapshot() else {
                    break;
                };
                let result = match bytes {
                    Ok(bytes) => write_atomic(&path, &bytes).await.map_err(DriveError::from),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => tracing::trace!(path = %path.display(), "state saved"),
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "state save failed"),
                }
            }
        });
        Self { notify }
    }

    /// Requests a save. Requests made while a save is running coalesce into one.
    pub fn request(&self) {
        self.notify.notify_one();
    }
}
