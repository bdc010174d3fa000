//! Keeps the metadata index in step with the remote.
//!
//! A cold start runs [`full_scan`]; afterwards [`ChangeSync`] polls the change
//! feed from the persisted cursor and folds every entry into the tree.

mod changes;
mod full_scan;

pub use changes::{Applied, PassReport, apply_change, apply_changes, as_change};
pub use full_scan::{ScanResult, ScanStore, build_tree, full_scan};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api_client::{Change, ChangeList, RemoteObject, RemoteStore};
use crate::cache::ChunkCache;
use crate::error::DriveError;
use crate::metadata::MetadataIndex;
use crate::persist;
use crate::retry::jitter;

pub const CURSOR_FILE: &str = "largest_change_id.json";

/// Multiplier cap for the page retry delay.
const MAX_DELAY_FACTOR: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Cursor {
    largest_change_id: u64,
}

/// Reads the persisted change cursor, if any.
pub async fn load_cursor(path: &Path) -> Result<Option<u64>, DriveError> {
    Ok(persist::load_json::<Cursor>(path).await?.map(|c| c.largest_change_id))
}

pub async fn save_cursor(path: &Path, largest_change_id: u64) -> Result<(), DriveError> {
    persist::save_json(path, &Cursor { largest_change_id }).await
}

/// Summary of one poll.
#[derive(Debug, Default)]
pub struct PollReport {
    pub fetched: usize,
    pub applied: usize,
    pub deferred: usize,
    pub largest_change_id: u64,
}

pub struct ChangeSync {
    remote: Arc<dyn RemoteStore>,
    index: Arc<MetadataIndex>,
    cache: Option<Arc<ChunkCache>>,
    cursor_path: Option<PathBuf>,
    refresh_delay: Duration,
    largest_change_id: Mutex<u64>,
    /// Entries whose parent was still unknown at the end of the last pass.
    deferred: Mutex<Vec<Change>>,
}

impl ChangeSync {
    /// # Arguments
    /// * `remote` - The object store.
    /// * `index` - Tree the changes are applied to.
    /// * `largest_change_id` - Last change already reflected in the tree.
    /// * `refresh_delay` - Base delay between polls and between page retries.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        index: Arc<MetadataIndex>,
        largest_change_id: u64,
        refresh_delay: Duration,
    ) -> Self {
        Self {
            remote,
            index,
            cache: None,
            cursor_path: None,
            refresh_delay,
            largest_change_id: Mutex::new(largest_change_id),
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Drops cached handles of objects deleted remotely.
    pub fn with_cache(mut self, cache: Arc<ChunkCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Persists the cursor to `path` after every pass that moves it.
    pub fn with_cursor_file(mut self, path: PathBuf) -> Self {
        self.cursor_path = Some(path);
        self
    }

    pub fn largest_change_id(&self) -> u64 {
        *self.largest_change_id.lock()
    }

    /// Queues listing rows a full scan could not place.
    pub fn defer(&self, files: Vec<RemoteObject>) {
        self.deferred.lock().extend(files.into_iter().map(as_change));
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Fetches one page, retrying for as long as it takes.
    async fn fetch_page(&self, start: u64, page_token: Option<&str>) -> ChangeList {
        let mut attempt: u32 = 0;
        loop {
            let err = match self.remote.list_changes(Some(start), page_token).await {
                Ok(page) => return page,
                Err(e) => e,
            };
            attempt += 1;
            if matches!(err, DriveError::CredentialInvalid) {
                if let Err(e) = self.remote.refresh_credentials().await {
                    warn!(error = %e, "credential refresh failed");
                }
            }
            let delay = self.refresh_delay * attempt.min(MAX_DELAY_FACTOR) + jitter(self.refresh_delay);
            warn!(attempt, error = %err, ?delay, "change page failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }

    /// Runs one pass over the change feed.
    pub async fn poll_once(&self) -> Result<PollReport, DriveError> {
        let cursor = self.largest_change_id();
        let mut largest = cursor;
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self.fetch_page(cursor + 1, page_token.as_deref()).await;
            largest = largest.max(page.largest_change_id);
            if let Some(last) = page.items.iter().map(|c| c.id).max() {
                largest = largest.max(last);
            }
            items.extend(page.items);
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        let fetched = items.len();
        let mut batch = std::mem::take(&mut *self.deferred.lock());
        let retried = batch.len();
        batch.extend(items);

        let mut report = PollReport { fetched, largest_change_id: largest, ..Default::default() };
        if !batch.is_empty() {
            let pass = self.index.write(|tree| apply_changes(tree, batch));
            report.applied = pass.applied;
            report.deferred = pass.deferred.len();
            if let Some(cache) = &self.cache {
                for remote_id in &pass.removed {
                    cache.forget(remote_id);
                }
            }
            if !pass.deferred.is_empty() {
                debug!(count = pass.deferred.len(), "entries still waiting for their parent");
            }
            *self.deferred.lock() = pass.deferred;
            info!(fetched, retried, applied = report.applied, deferred = report.deferred, largest, "change pass");
        }

        if largest != cursor {
            *self.largest_change_id.lock() = largest;
            if let Some(path) = &self.cursor_path {
                save_cursor(path, largest).await?;
            }
            self.index.save_now().await?;
        }
        Ok(report)
    }

    /// Polls forever, sleeping `refresh_delay` plus up to a quarter of it
    /// between passes.
    pub async fn run(self: Arc<Self>) {
        loop {
            if let Err(e) = self.poll_once().await {
                warn!(error = %e, "change pass failed to persist");
            }
            let pause = self.refresh_delay + jitter(self.refresh_delay / 4);
            tokio::time::sleep(pause).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cursor_round_trip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CURSOR_FILE);
        assert_eq!(load_cursor(&path).await.unwrap(), None);
        save_cursor(&path, 4242).await.unwrap();
        assert_eq!(load_cursor(&path).await.unwrap(), Some(4242));
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("largestChangeId"));
    }
}
