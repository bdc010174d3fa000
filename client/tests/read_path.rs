mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use drivefs::cache::{CacheSettings, ChunkCache, RemoteFile, SegmentIndex};
use drivefs::error::DriveError;
use drivefs_emulator::ROOT_ID;

use common::{CHUNK, Harness, eventually, pattern};

fn remote_file(h: &Harness, id: &str) -> RemoteFile {
    let drive = h.emulator.drive.lock();
    let object = drive.get(id).expect("seeded object");
    RemoteFile {
        remote_id: id.to_string(),
        size: object.file_size.as_deref().and_then(|s| s.parse().ok()).expect("size"),
        download_url: object.download_url.clone(),
    }
}

#[tokio::test]
async fn concurrent_readers_share_one_fetch() {
    let h = Harness::start().await;
    let body = pattern(50_000);
    let id = h.seed_file(ROOT_ID, "single.bin", body.clone());
    let file = remote_file(&h, &id);
    let cache = h.cache(0);

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            let file = file.clone();
            tokio::spawn(async move { cache.read(&file, 0, 4096).await })
        })
        .collect();
    for reader in readers {
        let bytes = reader.await.expect("join").expect("read");
        assert_eq!(bytes.as_ref(), &body[..4096]);
    }
    assert_eq!(h.emulator.downloads.load(Ordering::SeqCst), 1);

    let tail = cache.read(&file, 49_990, 100).await.expect("read tail");
    assert_eq!(tail.as_ref(), &body[49_990..]);
    assert_eq!(h.emulator.downloads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reads_spanning_three_windows_are_refused() {
    let h = Harness::start().await;
    let id = h.seed_file(ROOT_ID, "wide.bin", pattern((4 * CHUNK) as usize));
    let file = remote_file(&h, &id);
    let cache = h.cache(0);

    let err = cache.read(&file, 0, 3 * CHUNK).await.expect_err("too wide");
    assert!(matches!(err, DriveError::ReadTooLarge { offset: 0, .. }));
    assert_eq!(h.emulator.downloads.load(Ordering::SeqCst), 0);

    // Two windows are fine.
    let bytes = cache.read(&file, CHUNK - 10, 20).await.expect("straddling read");
    assert_eq!(bytes.len(), 20);
}

#[tokio::test]
async fn read_ahead_warms_following_and_final_windows() {
    let h = Harness::start().await;
    let body = pattern((4 * CHUNK + 10) as usize);
    let id = h.seed_file(ROOT_ID, "seq.bin", body.clone());
    let file = remote_file(&h, &id);
    let cache = h.cache(2);

    cache.read(&file, 0, 100).await.expect("first read");
    // Window 0, windows 1 and 2 ahead, and the final window 4.
    assert!(eventually(|| h.emulator.downloads.load(Ordering::SeqCst) == 4).await);

    let last = cache.read(&file, 4 * CHUNK, 10).await.expect("final window");
    assert_eq!(last.as_ref(), &body[(4 * CHUNK) as usize..]);
    assert_eq!(h.emulator.downloads.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn transient_download_failures_are_retried() {
    let h = Harness::start().await;
    let body = pattern(1000);
    let id = h.seed_file(ROOT_ID, "flaky.bin", body.clone());
    let file = remote_file(&h, &id);
    let cache = h.cache(0);

    h.emulator.inject_failures(2);
    let bytes = cache.read(&file, 0, 1000).await.expect("read after retries");
    assert_eq!(bytes.as_ref(), body.as_slice());
}

#[tokio::test]
async fn reads_past_the_end_are_empty() {
    let h = Harness::start().await;
    let id = h.seed_file(ROOT_ID, "small.bin", pattern(10));
    let file = remote_file(&h, &id);
    let cache = h.cache(0);

    assert!(cache.read(&file, 10, 5).await.expect("eof read").is_empty());
    assert_eq!(cache.read(&file, 8, 5).await.expect("clipped read").len(), 2);
}

#[tokio::test]
async fn forty_mib_file_read_across_three_default_chunks_is_refused() {
    const MIB: u64 = 1024 * 1024;
    let h = Harness::start().await;
    let segments = Arc::new(
        SegmentIndex::open(&h.db_path(), &h.config.download_dir(), h.config.max_cache_bytes()).expect("segments"),
    );
    let settings = CacheSettings { chunk_size: 16 * MIB, ..CacheSettings::from(&h.config) };
    let cache = ChunkCache::open(h.remote.clone(), settings, h.config.download_dir(), segments).expect("cache");
    let file = RemoteFile { remote_id: "big".to_string(), size: 40 * MIB, download_url: None };

    let err = cache.read(&file, 0, 45_000_000).await.expect_err("too wide");
    assert!(matches!(err, DriveError::ReadTooLarge { offset: 0, len: 45_000_000 }));
    assert_eq!(h.emulator.downloads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn zero_chunk_size_is_refused_at_open() {
    let h = Harness::start().await;
    let segments = Arc::new(
        SegmentIndex::open(&h.db_path(), &h.config.download_dir(), h.config.max_cache_bytes()).expect("segments"),
    );
    let settings = CacheSettings { chunk_size: 0, ..CacheSettings::from(&h.config) };
    let opened = ChunkCache::open(h.remote.clone(), settings, h.config.download_dir(), segments);
    assert!(matches!(opened, Err(DriveError::Settings(_))));
}

#[tokio::test]
async fn expired_download_url_is_resolved_again() {
    let h = Harness::start().await;
    let body = pattern(3000);
    let id = h.seed_file(ROOT_ID, "signed.bin", body.clone());
    let stale = remote_file(&h, &id);
    h.emulator.drive.lock().expire_download_urls();
    let cache = h.cache(0);

    let bytes = cache.read(&stale, 0, 3000).await.expect("read through a fresh url");
    assert_eq!(bytes.as_ref(), body.as_slice());
    assert_eq!(h.emulator.downloads.load(Ordering::SeqCst), 1);

    // The fresh URL is remembered for later windows of the same object.
    cache.read(&stale, 0, 10).await.expect("cached read");
    assert_eq!(h.emulator.downloads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cache_past_its_high_water_mark_evicts_the_oldest_segments() {
    let h = Harness::start().await;
    let segments = Arc::new(
        SegmentIndex::open(&h.db_path(), &h.config.download_dir(), 4 * CHUNK).expect("segments"),
    );
    let settings = CacheSettings { advanced_chunks: 0, max_bytes: 4 * CHUNK, ..CacheSettings::from(&h.config) };
    let cache = ChunkCache::open(h.remote.clone(), settings, h.config.download_dir(), segments).expect("cache");

    let mut files = Vec::new();
    for i in 0..4 {
        let id = h.seed_file(ROOT_ID, &format!("f{i}.bin"), pattern(CHUNK as usize));
        let file = remote_file(&h, &id);
        cache.read(&file, 0, 16).await.expect("read");
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        files.push(file);
    }
    assert_eq!(h.emulator.downloads.load(Ordering::SeqCst), 4);
    // Four windows pass 90 % of the budget; eviction stops below 80 %.
    assert!(eventually(|| cache.segments().total_bytes() == 3 * CHUNK).await);

    cache.read(&files[3], 0, 16).await.expect("recent window");
    assert_eq!(h.emulator.downloads.load(Ordering::SeqCst), 4);
    cache.read(&files[0], 0, 16).await.expect("evicted window");
    assert_eq!(h.emulator.downloads.load(Ordering::SeqCst), 5);
}
