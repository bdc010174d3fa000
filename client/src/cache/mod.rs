//! Chunked download cache.
//!
//! Remote files are cut into `chunk_size` windows. Each window is fetched with
//! one ranged GET and stored as a segment file `{remote_id}-{start}-{end}`
//! under `download/`. Reads are served from segments; missing windows are
//! fetched on demand, deduplicated across concurrent readers, and read-ahead
//! warms the following windows of a sequential reader.

mod fd_pool;
mod inflight;
mod segment_db;

pub use fd_pool::FdPool;
pub use inflight::{Attach, ChunkKey, InFlight};
pub use segment_db::{SegmentIndex, SegmentKind, is_segment_name, now_millis};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures_util::future::try_join_all;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::api_client::RemoteStore;
use crate::config::Config;
use crate::error::DriveError;
use crate::retry::{Backoff, RetryPolicy, with_retries};

/// Reads starting this close to a window start trigger read-ahead.
pub const READ_AHEAD_THRESHOLD: u64 = 128 * 1024;

/// How often an expired download URL is re-resolved before giving up.
const MAX_URL_REFRESHES: u32 = 2;

/// What the cache needs to know about a remote-backed file.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFile {
    pub remote_id: String,
    pub size: u64,
    pub download_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub chunk_size: u64,
    pub advanced_chunks: u64,
    pub fd_idle_timeout: Duration,
    pub max_bytes: u64,
    pub retry: RetryPolicy,
}

impl From<&Config> for CacheSettings {
    fn from(config: &Config) -> Self {
        Self {
            chunk_size: config.chunk_size,
            advanced_chunks: config.advanced_chunks,
            fd_idle_timeout: config.fd_idle_timeout(),
            max_bytes: config.max_cache_bytes(),
            retry: RetryPolicy::foreground(),
        }
    }
}

pub fn segment_name(remote_id: &str, start: u64, end: u64) -> String {
    format!("{remote_id}-{start}-{end}")
}

pub struct ChunkCache {
    remote: Arc<dyn RemoteStore>,
    dir: PathBuf,
    settings: CacheSettings,
    segments: Arc<SegmentIndex>,
    fds: FdPool,
    inflight: InFlight,
    /// Download URLs re-resolved after expiry, by remote id.
    urls: DashMap<String, String>,
}

impl ChunkCache {
    /// Opens the cache over `dir` with its index, registering any segment
    /// files left on disk by a previous run.
    pub fn open(
        remote: Arc<dyn RemoteStore>,
        settings: CacheSettings,
        dir: PathBuf,
        segments: Arc<SegmentIndex>,
    ) -> Result<Arc<Self>, DriveError> {
        if settings.chunk_size == 0 {
            return Err(DriveError::Settings("chunk size must be greater than zero".to_string()));
        }
        segments.reconcile_dir()?;
        info!(
            dir = %dir.display(),
            cached_bytes = segments.total_bytes(),
            budget = settings.max_bytes,
            "chunk cache ready"
        );
        Ok(Arc::new(Self {
            remote,
            dir,
            fds: FdPool::new(settings.fd_idle_timeout),
            settings,
            segments,
            inflight: InFlight::new(),
            urls: DashMap::new(),
        }))
    }

    pub fn segments(&self) -> &Arc<SegmentIndex> {
        &self.segments
    }

    pub fn chunk_size(&self) -> u64 {
        self.settings.chunk_size
    }

    /// Inclusive byte bounds of window `index` of a file of `size` bytes.
    fn window(&self, index: u64, size: u64) -> (u64, u64) {
        let start = index * self.settings.chunk_size;
        let end = (start + self.settings.chunk_size).min(size) - 1;
        (start, end)
    }

    fn segment_path(&self, remote_id: &str, start: u64, end: u64) -> PathBuf {
        self.dir.join(segment_name(remote_id, start, end))
    }

    /// Returns bytes `[offset, offset + len)` of `file`, clipped at EOF.
    ///
    /// # Arguments
    /// * `file` - Identity, size and download URL of the remote file.
    /// * `offset` - First byte requested.
    /// * `len` - Number of bytes requested. At most two windows may be touched.
    pub async fn read(self: &Arc<Self>, file: &RemoteFile, offset: u64, len: u64) -> Result<Bytes, DriveError> {
        if len == 0 || offset >= file.size {
            return Ok(Bytes::new());
        }
        let end = offset.saturating_add(len).min(file.size);
        let chunk = self.settings.chunk_size;
        let first = offset / chunk;
        let last = (end - 1) / chunk;
        if last - first > 1 {
            return Err(DriveError::ReadTooLarge { offset, len });
        }

        if offset - first * chunk < READ_AHEAD_THRESHOLD {
            self.schedule_read_ahead(file, first);
        }

        let windows: Vec<(u64, u64)> = (first..=last).map(|index| self.window(index, file.size)).collect();
        try_join_all(windows.iter().map(|&(start, stop)| self.ensure_chunk(file, start, stop))).await?;

        let mut out = BytesMut::with_capacity((end - offset) as usize);
        for (start, stop) in windows {
            let from = offset.max(start);
            let to = end.min(stop + 1);
            let key = ChunkKey::new(&file.remote_id, start);
            let path = self.segment_path(&file.remote_id, start, stop);
            let bytes = self.fds.read_at(&key, &path, from - start, (to - from) as usize).await?;
            if (bytes.len() as u64) < to - from {
                // Segment shrank underneath us (evicted between check and read).
                self.fds.invalidate(&key);
                return Err(DriveError::Integrity(segment_name(&file.remote_id, start, stop)));
            }
            out.extend_from_slice(&bytes);

            if let Err(e) = self.segments.touch(&segment_name(&file.remote_id, start, stop), now_millis()) {
                warn!(error = %e, "cannot update segment access time");
            }
        }
        Ok(out.freeze())
    }

    /// Prefetches the next `advanced_chunks` windows and the final window.
    fn schedule_read_ahead(self: &Arc<Self>, file: &RemoteFile, current: u64) {
        let last_index = (file.size - 1) / self.settings.chunk_size;
        let mut wanted: BTreeSet<u64> = (1..=self.settings.advanced_chunks)
            .map(|i| current + i)
            .filter(|i| *i <= last_index)
            .collect();
        if last_index > current {
            wanted.insert(last_index);
        }
        for index in wanted {
            let (start, end) = self.window(index, file.size);
            let cache = Arc::clone(self);
            let file = file.clone();
            tokio::spawn(async move {
                if let Err(e) = cache.ensure_chunk(&file, start, end).await {
                    debug!(remote_id = %file.remote_id, start, error = %e, "read-ahead failed");
                }
            });
        }
    }

    async fn segment_present(&self, remote_id: &str, start: u64, end: u64) -> bool {
        match tokio::fs::metadata(self.segment_path(remote_id, start, end)).await {
            Ok(meta) => meta.len() == end - start + 1,
            Err(_) => false,
        }
    }

    /// Makes sure window `[start, end]` of `file` is on disk.
    async fn ensure_chunk(&self, file: &RemoteFile, start: u64, end: u64) -> Result<(), DriveError> {
        let key = ChunkKey::new(&file.remote_id, start);
        loop {
            if self.segment_present(&file.remote_id, start, end).await {
                return Ok(());
            }
            match self.inflight.attach(&key) {
                Attach::Leader(guard) => {
                    // The previous leader may have finished between our check and attach.
                    if self.segment_present(&file.remote_id, start, end).await {
                        guard.complete(Ok(()));
                        return Ok(());
                    }
                    let result = self.fetch_chunk(file, start, end).await;
                    guard.complete(result.as_ref().map(|_| ()).map_err(|e| Arc::new(e.duplicate())));
                    return result;
                }
                Attach::Waiter(mut receiver) => match receiver.recv().await {
                    Ok(Ok(())) => return Ok(()),
                    Ok(Err(e)) => return Err(e.duplicate()),
                    // Leader vanished without a result; try again.
                    Err(_) => continue,
                },
            }
        }
    }

    async fn download_url(&self, file: &RemoteFile) -> Result<String, DriveError> {
        let refreshed = self.urls.get(&file.remote_id).map(|u| u.clone());
        if let Some(url) = refreshed {
            return Ok(url);
        }
        match &file.download_url {
            Some(url) => Ok(url.clone()),
            None => self.resolve_url(&file.remote_id).await,
        }
    }

    /// Looks the object up again to obtain a fresh download URL.
    async fn resolve_url(&self, remote_id: &str) -> Result<String, DriveError> {
        let remote = self.remote.as_ref();
        let object = with_retries(remote, &self.settings.retry, "resolve download url", || {
            remote.get_object(remote_id)
        })
        .await?;
        let url = object
            .download_url
            .ok_or_else(|| DriveError::NotFound(format!("{remote_id} has no download url")))?;
        self.urls.insert(remote_id.to_string(), url.clone());
        Ok(url)
    }

    async fn fetch_chunk(&self, file: &RemoteFile, start: u64, end: u64) -> Result<(), DriveError> {
        let expected = end - start + 1;
        let mut url = self.download_url(file).await?;
        let mut backoff = Backoff::new(self.settings.retry.base, self.settings.retry.cap);
        let mut attempts = 1;
        let mut url_refreshes = 0;
        let mut auth_refreshes = 0;
        let mut integrity_retried = false;

        loop {
            debug!(remote_id = %file.remote_id, start, end, attempts, "fetching chunk");
            match self.remote.download_range(&url, start, end).await {
                Ok(bytes) if bytes.len() as u64 == expected => {
                    return self.store_segment(&file.remote_id, start, end, &bytes).await;
                }
                Ok(bytes) => {
                    warn!(
                        remote_id = %file.remote_id,
                        start,
                        expected,
                        actual = bytes.len(),
                        "short chunk body"
                    );
                    if integrity_retried {
                        return Err(DriveError::Integrity(segment_name(&file.remote_id, start, end)));
                    }
                    integrity_retried = true;
                }
                Err(DriveError::CredentialExpired) if url_refreshes < MAX_URL_REFRESHES => {
                    url_refreshes += 1;
                    info!(remote_id = %file.remote_id, "download url expired, re-resolving");
                    url = self.resolve_url(&file.remote_id).await?;
                }
                Err(DriveError::CredentialInvalid) if auth_refreshes < MAX_URL_REFRESHES => {
                    auth_refreshes += 1;
                    self.remote.refresh_credentials().await?;
                }
                Err(e) if e.is_transient() && attempts < self.settings.retry.max_attempts => {
                    attempts += 1;
                    let delay = backoff.next_delay();
                    warn!(remote_id = %file.remote_id, start, error = %e, ?delay, "chunk fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes a segment through a temporary file and records it.
    async fn store_segment(&self, remote_id: &str, start: u64, end: u64, bytes: &[u8]) -> Result<(), DriveError> {
        let name = segment_name(remote_id, start, end);
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!("{name}.part"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        self.fds.invalidate(&ChunkKey::new(remote_id, start));
        self.segments.record(&name, bytes.len() as u64, SegmentKind::Downloading, now_millis())?;
        self.maybe_evict();
        Ok(())
    }

    /// Starts an eviction in the background once the cache passes 90 %.
    pub fn maybe_evict(&self) {
        if !self.segments.needs_eviction() {
            return;
        }
        let segments = Arc::clone(&self.segments);
        let fds = self.fds.clone();
        tokio::spawn(async move {
            match tokio::task::spawn_blocking(move || segments.evict()).await {
                Ok(Ok(evicted)) => {
                    for name in evicted {
                        if let Some(key) = parse_segment_key(&name) {
                            fds.invalidate(&key);
                        }
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "eviction failed"),
                Err(e) => warn!(error = %e, "eviction task failed"),
            }
        });
    }

    /// Copies a staged upload into chunk segments so the freshly uploaded
    /// file is readable without downloading it again.
    ///
    /// # Arguments
    /// * `remote_id` - Id the upload received.
    /// * `size` - Size of the staged file.
    /// * `path` - Staged file.
    pub async fn import_staged(&self, remote_id: &str, size: u64, path: &Path) -> Result<(), DriveError> {
        if size == 0 {
            return Ok(());
        }
        let mut staged = tokio::fs::File::open(path).await?;
        let chunks = size.div_ceil(self.settings.chunk_size);
        for index in 0..chunks {
            let (start, end) = self.window(index, size);
            let mut buf = vec![0u8; (end - start + 1) as usize];
            staged.seek(std::io::SeekFrom::Start(start)).await?;
            staged.read_exact(&mut buf).await?;
            self.store_segment(remote_id, start, end, &buf).await?;
        }
        debug!(remote_id, size, chunks, "imported staged upload into cache");
        Ok(())
    }

    /// Forgets pooled handles and resolved URLs of an object.
    pub fn forget(&self, remote_id: &str) {
        self.fds.invalidate_object(remote_id);
        self.urls.remove(remote_id);
    }
}

fn parse_segment_key(name: &str) -> Option<ChunkKey> {
    let mut parts = name.rsplitn(3, '-');
    let _end = parts.next()?;
    let start: u64 = parts.next()?.parse().ok()?;
    let remote_id = parts.next()?;
    Some(ChunkKey::new(remote_id, start))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_names_round_trip_through_key_parsing() {
        let name = segment_name("0B-abc_d", 16777216, 33554431);
        assert_eq!(name, "0B-abc_d-16777216-33554431");
        assert!(is_segment_name(&name));
        assert_eq!(parse_segment_key(&name), Some(ChunkKey::new("0B-abc_d", 16777216)));
        assert_eq!(parse_segment_key("nodashes"), None);
    }
}
