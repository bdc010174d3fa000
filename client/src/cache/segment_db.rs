//! Durable index of cache segments (`cache.db`, table `files`).
//!
//! Tracks the size, last access time and kind of every segment on disk and
//! keeps a running byte total so eviction decisions need no directory walk.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::error::DriveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Fetched from the remote; may be evicted.
    Downloading,
    /// Staged for upload; never evicted.
    Uploading,
}

impl SegmentKind {
    fn as_str(self) -> &'static str {
        match self {
            SegmentKind::Downloading => "downloading",
            SegmentKind::Uploading => "uploading",
        }
    }
}

/// Milliseconds since the epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct SegmentIndex {
    conn: Mutex<Connection>,
    download_dir: PathBuf,
    max_bytes: u64,
    total: AtomicU64,
    evicting: AtomicBool,
}

impl SegmentIndex {
    pub fn open(db_path: &Path, download_dir: &Path, max_bytes: u64) -> Result<Self, DriveError> {
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn, download_dir, max_bytes)
    }

    pub fn with_connection(conn: Connection, download_dir: &Path, max_bytes: u64) -> Result<Self, DriveError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                name TEXT PRIMARY KEY,
                atime INTEGER NOT NULL,
                type TEXT NOT NULL,
                size INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS files_by_atime ON files (atime, size);",
        )?;
        let total: i64 = conn.query_row("SELECT COALESCE(SUM(size), 0) FROM files", [], |row| row.get(0))?;
        Ok(Self {
            conn: Mutex::new(conn),
            download_dir: download_dir.to_path_buf(),
            max_bytes,
            total: AtomicU64::new(total as u64),
            evicting: AtomicBool::new(false),
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Inserts or replaces a segment record.
    pub fn record(&self, name: &str, size: u64, kind: SegmentKind, atime: i64) -> Result<(), DriveError> {
        let conn = self.conn.lock();
        let previous: Option<i64> = conn
            .query_row("SELECT size FROM files WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?;
        conn.execute(
            "INSERT OR REPLACE INTO files (name, atime, type, size) VALUES (?1, ?2, ?3, ?4)",
            params![name, atime, kind.as_str(), size as i64],
        )?;
        let previous = previous.unwrap_or(0) as u64;
        if size >= previous {
            self.total.fetch_add(size - previous, Ordering::SeqCst);
        } else {
            self.total.fetch_sub(previous - size, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn touch(&self, name: &str, atime: i64) -> Result<(), DriveError> {
        self.conn
            .lock()
            .execute("UPDATE files SET atime = ?1 WHERE name = ?2", params![atime, name])?;
        Ok(())
    }

    pub fn size_of(&self, name: &str) -> Result<Option<u64>, DriveError> {
        let size: Option<i64> = self
            .conn
            .lock()
            .query_row("SELECT size FROM files WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?;
        Ok(size.map(|s| s as u64))
    }

    pub fn remove(&self, name: &str) -> Result<(), DriveError> {
        let conn = self.conn.lock();
        let previous: Option<i64> = conn
            .query_row("SELECT size FROM files WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?;
        if let Some(size) = previous {
            conn.execute("DELETE FROM files WHERE name = ?1", params![name])?;
            self.total.fetch_sub(size as u64, Ordering::SeqCst);
        }
        Ok(())
    }

    /// True once the total passes 90 % of the budget.
    pub fn needs_eviction(&self) -> bool {
        self.total_bytes() as u128 * 10 > self.max_bytes as u128 * 9
    }

    fn below_low_water(&self) -> bool {
        self.total_bytes() as u128 * 10 < self.max_bytes as u128 * 8
    }

    /// Removes downloaded segments, least recently used first (ties broken by
    /// size), until the total drops below 80 % of the budget. Only one
    /// eviction runs at a time; a concurrent call returns immediately.
    /// Returns the names of the removed segments.
    pub fn evict(&self) -> Result<Vec<String>, DriveError> {
        if self.evicting.swap(true, Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let result = self.evict_locked();
        self.evicting.store(false, Ordering::SeqCst);
        result
    }

    fn evict_locked(&self) -> Result<Vec<String>, DriveError> {
        let mut evicted = Vec::new();
        while !self.below_low_water() {
            let batch: Vec<(String, i64)> = {
                let conn = self.conn.lock();
                let mut stmt = conn.prepare(
                    "SELECT name, size FROM files WHERE type = 'downloading'
                     ORDER BY atime ASC, size ASC LIMIT 64",
                )?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<Result<_, _>>()?
            };
            if batch.is_empty() {
                warn!(total = self.total_bytes(), "nothing left to evict");
                break;
            }
            let before = evicted.len();
            for (name, _) in batch {
                if self.below_low_water() {
                    break;
                }
                match std::fs::remove_file(self.download_dir.join(&name)) {
                    Ok(()) => {}
                    // Already gone: counts as reclaimed.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(segment = %name, error = %e, "cannot remove segment");
                        continue;
                    }
                }
                self.remove(&name)?;
                debug!(segment = %name, "evicted");
                evicted.push(name);
            }
            if evicted.len() == before {
                break;
            }
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), total = self.total_bytes(), "cache eviction finished");
        }
        Ok(evicted)
    }

    /// Registers segment files found on disk that the index does not know,
    /// with access time 0, and drops rows whose downloaded file is gone.
    pub fn reconcile_dir(&self) -> Result<usize, DriveError> {
        let mut found = 0;
        for entry in std::fs::read_dir(&self.download_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_segment_name(&name) {
                continue;
            }
            let size = entry.metadata()?.len();
            let inserted = self.conn.lock().execute(
                "INSERT OR IGNORE INTO files (name, atime, type, size) VALUES (?1, 0, 'downloading', ?2)",
                params![name, size as i64],
            )?;
            if inserted > 0 {
                self.total.fetch_add(size, Ordering::SeqCst);
                found += 1;
            }
        }

        let known: Vec<String> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare("SELECT name FROM files WHERE type = 'downloading'")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        for name in known {
            if !self.download_dir.join(&name).exists() {
                self.remove(&name)?;
            }
        }
        if found > 0 {
            info!(found, "registered untracked cache segments");
        }
        Ok(found)
    }
}

/// Matches `{remote_id}-{start}-{end}`.
static SEGMENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]*-([0-9]+)-([0-9]+)$").expect("segment name pattern"));

pub fn is_segment_name(name: &str) -> bool {
    SEGMENT_NAME.is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn index(dir: &Path, max: u64) -> SegmentIndex {
        SegmentIndex::with_connection(Connection::open_in_memory().unwrap(), dir, max).unwrap()
    }

    fn put(index: &SegmentIndex, dir: &Path, name: &str, size: u64, atime: i64) {
        std::fs::write(dir.join(name), vec![0u8; size as usize]).unwrap();
        index.record(name, size, SegmentKind::Downloading, atime).unwrap();
    }

    #[test]
    fn totals_follow_records() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path(), 100);
        idx.record("a-0-9", 10, SegmentKind::Downloading, 1).unwrap();
        idx.record("b-0-4", 5, SegmentKind::Uploading, 1).unwrap();
        assert_eq!(idx.total_bytes(), 15);
        idx.record("a-0-9", 8, SegmentKind::Downloading, 2).unwrap();
        assert_eq!(idx.total_bytes(), 13);
        idx.remove("b-0-4").unwrap();
        idx.remove("b-0-4").unwrap();
        assert_eq!(idx.total_bytes(), 8);
        assert_eq!(idx.size_of("a-0-9").unwrap(), Some(8));
    }

    #[test]
    fn eviction_from_95_percent_leaves_at_most_80_least_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path(), 20 * MIB);
        // 19 segments of 1 MiB = 95 % of the budget; atime equals the index.
        for i in 0..19 {
            put(&idx, dir.path(), &format!("obj-{}-{}", i * MIB, (i + 1) * MIB - 1), MIB, i as i64);
        }
        assert!(idx.needs_eviction());

        let evicted = idx.evict().unwrap();
        assert!(idx.total_bytes() * 10 <= idx.max_bytes() * 8);
        assert_eq!(evicted.len(), 4);
        for (i, name) in evicted.iter().enumerate() {
            let i = i as u64;
            assert_eq!(name, &format!("obj-{}-{}", i * MIB, (i + 1) * MIB - 1));
            assert!(!dir.path().join(name).exists());
        }
        assert!(dir.path().join(format!("obj-{}-{}", 4 * MIB, 5 * MIB - 1)).exists());
    }

    #[test]
    fn ties_on_atime_evict_smaller_first() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path(), 100);
        put(&idx, dir.path(), "big-0-59", 60, 5);
        put(&idx, dir.path(), "small-0-34", 35, 5);
        let evicted = idx.evict().unwrap();
        assert_eq!(evicted, vec!["small-0-34".to_string()]);
        assert_eq!(idx.total_bytes(), 60);
    }

    #[test]
    fn staged_segments_are_never_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path(), 100);
        idx.record("staged", 95, SegmentKind::Uploading, 0).unwrap();
        assert!(idx.needs_eviction());
        assert!(idx.evict().unwrap().is_empty());
        assert_eq!(idx.total_bytes(), 95);
    }

    #[test]
    fn missing_files_count_as_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path(), 100);
        idx.record("ghost-0-94", 95, SegmentKind::Downloading, 0).unwrap();
        assert_eq!(idx.evict().unwrap(), vec!["ghost-0-94".to_string()]);
        assert_eq!(idx.total_bytes(), 0);
    }

    #[test]
    fn reconcile_registers_untracked_files_with_zero_atime() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path(), 1000);
        std::fs::write(dir.path().join("abc_1-0-9"), [0u8; 10]).unwrap();
        std::fs::write(dir.path().join("not a segment"), [0u8; 3]).unwrap();
        idx.record("vanished-0-4", 5, SegmentKind::Downloading, 7).unwrap();

        assert_eq!(idx.reconcile_dir().unwrap(), 1);
        assert_eq!(idx.size_of("abc_1-0-9").unwrap(), Some(10));
        assert_eq!(idx.size_of("vanished-0-4").unwrap(), None);
        assert_eq!(idx.total_bytes(), 10);
        assert_eq!(idx.reconcile_dir().unwrap(), 0);
    }
}
