//! Pool of open segment files.
//!
//! Handles stay open for an idle timeout after their last use so that a
//! sequential reader does not reopen the same segment for every 128 KiB
//! request. Concurrent openers of one segment converge on a single handle.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;

use super::inflight::ChunkKey;

struct Pooled {
    file: Arc<File>,
    last_used: Mutex<Instant>,
}

impl Pooled {
    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }
}

#[derive(Clone)]
pub struct FdPool {
    entries: Arc<DashMap<ChunkKey, Arc<Pooled>>>,
    idle_timeout: Duration,
}

impl FdPool {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { entries: Arc::new(DashMap::new()), idle_timeout }
    }

    /// Returns the pooled handle for `key`, opening `path` if needed.
    pub async fn get_or_open(&self, key: &ChunkKey, path: &Path) -> io::Result<Arc<File>> {
        let cached = self.entries.get(key).map(|p| p.clone());
        if let Some(pooled) = cached {
            pooled.touch();
            return Ok(pooled.file.clone());
        }

        let owned = path.to_path_buf();
        let file = tokio::task::spawn_blocking(move || File::open(owned))
            .await
            .map_err(io::Error::other)??;

        let pooled = match self.entries.entry(key.clone()) {
            // Someone else opened it meanwhile; ours is closed on drop.
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => {
                let pooled = Arc::new(Pooled { file: Arc::new(file), last_used: Mutex::new(Instant::now()) });
                vacant.insert(pooled.clone());
                self.spawn_reaper(key.clone(), pooled.clone());
                pooled
            }
        };
        pooled.touch();
        Ok(pooled.file.clone())
    }

    fn spawn_reaper(&self, key: ChunkKey, pooled: Arc<Pooled>) {
        let entries = Arc::clone(&self.entries);
        let idle = self.idle_timeout;
        tokio::spawn(async move {
            loop {
                let idle_for = pooled.idle_for();
                if idle_for >= idle {
                    entries.remove_if(&key, |_, current| Arc::ptr_eq(current, &pooled));
                    tracing::trace!(remote_id = %key.remote_id, start = key.start, "closed idle segment");
                    break;
                }
                tokio::time::sleep(idle - idle_for).await;
            }
        });
    }

    /// Reads up to `len` bytes at `offset` of the pooled segment.
    pub async fn read_at(&self, key: &ChunkKey, path: &Path, offset: u64, len: usize) -> io::Result<Bytes> {
        let file = self.get_or_open(key, path).await?;
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            let mut filled = 0;
            while filled < len {
                let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(io::Error::other)?
    }

    pub fn invalidate(&self, key: &ChunkKey) {
        self.entries.remove(key);
    }

    /// Drops every handle of one remote object.
    pub fn invalidate_object(&self, remote_id: &str) {
        self.entries.retain(|key, _| key.remote_id != remote_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_opens_share_one_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        std::fs::write(&path, b"hello world").unwrap();
        let pool = FdPool::new(Duration::from_secs(60));
        let key = ChunkKey::new("id", 0);

        let (a, b) = tokio::join!(pool.get_or_open(&key, &path), pool.get_or_open(&key, &path));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);

        let bytes = pool.read_at(&key, &path, 6, 5).await.unwrap();
        assert_eq!(&bytes[..], b"world");
    }

    #[tokio::test]
    async fn idle_handles_are_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        std::fs::write(&path, b"x").unwrap();
        let pool = FdPool::new(Duration::from_millis(50));
        pool.get_or_open(&ChunkKey::new("id", 0), &path).await.unwrap();
        assert_eq!(pool.len(), 1);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn invalidate_object_drops_all_windows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        std::fs::write(&path, b"x").unwrap();
        let pool = FdPool::new(Duration::from_secs(60));
        pool.get_or_open(&ChunkKey::new("a", 0), &path).await.unwrap();
        pool.get_or_open(&ChunkKey::new("a", 16), &path).await.unwrap();
        pool.get_or_open(&ChunkKey::new("b", 0), &path).await.unwrap();
        pool.invalidate_object("a");
        assert_eq!(pool.len(), 1);
    }
}
