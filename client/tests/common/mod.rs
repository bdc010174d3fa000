#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use drivefs::api_client::{DriveClient, RemoteStore};
use drivefs::auth::StaticToken;
use drivefs::cache::{CacheSettings, ChunkCache, SegmentIndex};
use drivefs::config::Config;
use drivefs::fs::RemoteFS;
use drivefs::metadata::MetadataIndex;
use drivefs::retry::RetryPolicy;
use drivefs::sync::{ScanStore, full_scan};
use drivefs::upload::{UploadEngine, UploadLedger, UploadSettings};
use drivefs_emulator::SharedState;

pub const TOKEN: &str = "integration-token";
pub const CHUNK: u64 = 64 * 1024;

/// An emulator plus a client configured against it, in a scratch cache directory.
pub struct Harness {
    pub emulator: SharedState,
    pub remote: Arc<dyn RemoteStore>,
    pub config: Config,
    pub largest_change_id: u64,
    _dir: TempDir,
}

/// Everything a mounted filesystem is made of.
pub struct Mounted {
    pub fs: Arc<RemoteFS>,
    pub index: Arc<MetadataIndex>,
    pub cache: Arc<ChunkCache>,
    pub uploads: Arc<UploadEngine>,
}

impl Harness {
    pub async fn start() -> Self {
        let (base, emulator) = drivefs_emulator::spawn(Some(TOKEN.to_string())).await.expect("spawn emulator");
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            cache_location: dir.path().to_path_buf(),
            chunk_size: CHUNK,
            advanced_chunks: 0,
            refresh_delay_ms: 20,
            upload_settle_delay_secs: 0,
            api_url: format!("{base}/drive/v2"),
            upload_url: format!("{base}/upload/drive/v2"),
            ..Config::default()
        };
        config.ensure_dirs().expect("cache dirs");
        let remote: Arc<dyn RemoteStore> = Arc::new(DriveClient::new(
            &config.api_url,
            &config.upload_url,
            Arc::new(StaticToken(TOKEN.to_string())),
        ));
        Self { emulator, remote, config, largest_change_id: 0, _dir: dir }
    }

    /// Stores a file directly in the emulator and returns its id.
    pub fn seed_file(&self, parent_id: &str, title: &str, bytes: Vec<u8>) -> String {
        self.emulator
            .drive
            .lock()
            .insert_file(parent_id, title, "application/octet-stream", bytes)
            .expect("seed file")
            .id
    }

    pub fn seed_folder(&self, parent_id: &str, title: &str) -> String {
        self.emulator.drive.lock().insert_folder(parent_id, title).expect("seed folder").id
    }

    pub fn db_path(&self) -> PathBuf {
        self.config.data_dir().join("cache.db")
    }

    pub fn cache(&self, advanced_chunks: u64) -> Arc<ChunkCache> {
        let segments = Arc::new(
            SegmentIndex::open(&self.db_path(), &self.config.download_dir(), self.config.max_cache_bytes())
                .expect("segment index"),
        );
        let settings = CacheSettings {
            advanced_chunks,
            retry: RetryPolicy { max_attempts: 3, base: Duration::from_millis(5), cap: Duration::from_millis(20) },
            ..CacheSettings::from(&self.config)
        };
        ChunkCache::open(self.remote.clone(), settings, self.config.download_dir(), segments).expect("chunk cache")
    }

    /// Lists the emulator and assembles the filesystem on top of the result.
    pub async fn mount(&mut self) -> Mounted {
        self.mount_with_settle(Duration::ZERO).await
    }

    /// Like [`Harness::mount`], with released files held back for `settle`.
    pub async fn mount_with_settle(&mut self, settle: Duration) -> Mounted {
        let store = ScanStore::in_memory().expect("scan store");
        let scan = full_scan(self.remote.as_ref(), &store, &RetryPolicy::foreground()).await.expect("full scan");
        self.largest_change_id = scan.largest_change_id;

        let index = MetadataIndex::in_memory(scan.tree);
        let cache = self.cache(self.config.advanced_chunks);
        let settings = UploadSettings {
            retry: RetryPolicy { max_attempts: 4, base: Duration::from_millis(5), cap: Duration::from_millis(20) },
            settle_delay: settle,
            requeue_delay: Duration::from_millis(20),
            ..UploadSettings::from(&self.config)
        };
        let uploads = UploadEngine::new(
            self.remote.clone(),
            index.clone(),
            cache.clone(),
            UploadLedger::in_memory(),
            self.config.upload_dir(),
            settings,
        );
        let fs = Arc::new(RemoteFS::new(
            index.clone(),
            cache.clone(),
            uploads.clone(),
            self.remote.clone(),
            Duration::from_secs(1),
        ));
        Mounted { fs, index, cache, uploads }
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
