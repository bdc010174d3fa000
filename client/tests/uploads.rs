mod common;

use std::ffi::OsStr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use drivefs::api_client::{DriveClient, RemoteStore, UploadRequest, UploadStatus};
use drivefs::auth::FileTokenProvider;
use drivefs::error::DriveError;
use drivefs::fs;
use drivefs::metadata::ROOT_INODE;
use drivefs::upload::ResumeReport;
use drivefs_emulator::ROOT_ID;

use common::{Harness, eventually, pattern};

fn uploaded_content(h: &Harness, title: &str) -> Option<Vec<u8>> {
    let drive = h.emulator.drive.lock();
    let (items, _) = drive.list(1000, None);
    let file = items.into_iter().find(|f| f.title == title && !f.labels.trashed)?;
    drive.content(&file.id).map(<[u8]>::to_vec)
}

fn trashed_copies(h: &Harness, title: &str) -> usize {
    let (items, _) = h.emulator.drive.lock().list(1000, None);
    items.iter().filter(|f| f.title == title && f.labels.trashed).count()
}

fn session_request(title: &str, size: usize) -> UploadRequest {
    UploadRequest {
        parent_id: ROOT_ID.to_string(),
        title: title.to_string(),
        size: size as u64,
        mime_type: "text/plain".to_string(),
    }
}

#[tokio::test]
async fn interrupted_upload_resumes_after_the_last_stored_byte() {
    let mut h = Harness::start().await;
    let m = h.mount().await;
    let data = pattern(10_000);

    let (attr, fh) = fs::create(&m.fs, ROOT_INODE, OsStr::new("notes.txt"), 0o644).await.expect("create");
    fs::write(&m.fs, attr.ino, fh, 0, &data).await.expect("write");

    // A previous run opened a session and got 4000 bytes through.
    let request = session_request("notes.txt", data.len());
    let location = h.remote.create_upload_session(&request).await.expect("session");
    let session_id = location.rsplit('/').next().expect("session id").to_string();
    h.emulator.drive.lock().put_session(&session_id, 0, &data[..4000]).expect("partial put");

    let queried = h.remote.query_upload_offset(&location, data.len() as u64).await.expect("offset query");
    assert_eq!(queried, UploadStatus::Incomplete { last_byte: Some(3999) });
    assert_eq!(queried.resume_offset(), 4000);

    m.uploads.ledger().update(attr.ino, |entry| entry.location = Some(location.clone()));
    fs::release(&m.fs, attr.ino, fh).await.expect("release");
    let uploads = m.uploads.clone();
    assert!(eventually(|| !uploads.is_pending(attr.ino)).await);

    assert_eq!(h.emulator.drive.lock().upload_offsets, vec![0, 4000]);
    assert_eq!(uploaded_content(&h, "notes.txt").as_deref(), Some(data.as_slice()));
    let node = m.index.get(attr.ino).expect("node kept");
    assert!(node.remote_id.is_some());

    // The staged bytes were moved into the cache; no download needed.
    let rfh = fs::open(&m.fs, attr.ino, libc::O_RDONLY).await.expect("open");
    let bytes = fs::read(&m.fs, attr.ino, rfh, 5000, 100).await.expect("read");
    assert_eq!(bytes.as_ref(), &data[5000..5100]);
    assert_eq!(h.emulator.downloads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn released_file_is_uploaded_in_the_background() {
    let mut h = Harness::start().await;
    let m = h.mount().await;
    let data = pattern(3000);

    let (attr, fh) = fs::create(&m.fs, ROOT_INODE, OsStr::new("report.csv"), 0o644).await.expect("create");
    fs::write(&m.fs, attr.ino, fh, 0, &data[..1000]).await.expect("write");
    fs::write(&m.fs, attr.ino, fh, 1000, &data[1000..]).await.expect("write");
    assert_eq!(fs::getattr(&m.fs, attr.ino).await.expect("getattr").size, 3000);

    // Readable from staging before the upload.
    let bytes = fs::read(&m.fs, attr.ino, fh, 0, 10).await.expect("staged read");
    assert_eq!(bytes.as_ref(), &data[..10]);

    fs::release(&m.fs, attr.ino, fh).await.expect("release");
    let index = m.index.clone();
    assert!(eventually(|| index.get(attr.ino).is_some_and(|n| n.remote_id.is_some())).await);
    assert_eq!(uploaded_content(&h, "report.csv").as_deref(), Some(data.as_slice()));
}

#[tokio::test]
async fn empty_files_stay_local() {
    let mut h = Harness::start().await;
    let m = h.mount().await;

    let (attr, fh) = fs::create(&m.fs, ROOT_INODE, OsStr::new("empty"), 0o644).await.expect("create");
    fs::release(&m.fs, attr.ino, fh).await.expect("release");

    let uploads = m.uploads.clone();
    assert!(eventually(|| !uploads.is_pending(attr.ino)).await);
    assert!(m.index.get(attr.ino).is_some_and(|n| n.remote_id.is_none()));
    assert!(uploaded_content(&h, "empty").is_none());
}

#[tokio::test]
async fn unlinking_a_pending_file_drops_its_upload() {
    let mut h = Harness::start().await;
    let m = h.mount().await;

    let (attr, fh) = fs::create(&m.fs, ROOT_INODE, OsStr::new("draft"), 0o644).await.expect("create");
    fs::write(&m.fs, attr.ino, fh, 0, b"scratch").await.expect("write");
    let staged = m.uploads.staged_path(attr.ino).expect("staging path");
    assert!(staged.exists());

    fs::unlink(&m.fs, ROOT_INODE, OsStr::new("draft")).await.expect("unlink");
    assert!(!m.uploads.is_pending(attr.ino));
    assert!(!staged.exists());
    assert!(m.index.get(attr.ino).is_none());
}

#[tokio::test]
async fn remote_backed_files_refuse_write_opens() {
    let mut h = Harness::start().await;
    h.seed_file(ROOT_ID, "fixed.bin", pattern(10));
    let m = h.mount().await;

    let attr = fs::lookup(&m.fs, ROOT_INODE, OsStr::new("fixed.bin")).await.expect("lookup");
    let err = fs::open(&m.fs, attr.ino, libc::O_WRONLY).await.expect_err("write open");
    assert_eq!(err.errno(), libc::EACCES);
}

#[tokio::test]
async fn restart_discards_unreleased_files_and_adopts_untracked_staging() {
    let mut h = Harness::start().await;
    let m = h.mount().await;

    // Still open when the process died.
    let (open_attr, open_fh) = fs::create(&m.fs, ROOT_INODE, OsStr::new("half.txt"), 0o644).await.expect("create");
    fs::write(&m.fs, open_attr.ino, open_fh, 0, b"partial").await.expect("write");
    let open_staged = m.uploads.staged_path(open_attr.ino).expect("staging path");

    // Written completely, but the ledger entry never reached disk.
    let data = pattern(2000);
    let (lost_attr, lost_fh) = fs::create(&m.fs, ROOT_INODE, OsStr::new("lost.bin"), 0o644).await.expect("create");
    fs::write(&m.fs, lost_attr.ino, lost_fh, 0, &data).await.expect("write");
    m.uploads.ledger().remove(lost_attr.ino);

    let report = m.uploads.resume().await.expect("resume");
    assert_eq!(report, ResumeReport { requeued: 0, discarded: 1, adopted: 1 });
    assert!(m.index.get(open_attr.ino).is_none());
    assert!(!open_staged.exists());

    let index = m.index.clone();
    assert!(eventually(|| index.get(lost_attr.ino).is_some_and(|n| n.remote_id.is_some())).await);
    assert_eq!(uploaded_content(&h, "lost.bin").as_deref(), Some(data.as_slice()));
}

#[tokio::test]
async fn refused_content_type_keeps_the_upload_pending() {
    let mut h = Harness::start().await;
    h.emulator.drive.lock().refused_media.push("image/png".to_string());
    let m = h.mount().await;

    let (attr, fh) = fs::create(&m.fs, ROOT_INODE, OsStr::new("photo.png"), 0o644).await.expect("create");
    fs::write(&m.fs, attr.ino, fh, 0, b"not really a png").await.expect("write");
    fs::release(&m.fs, attr.ino, fh).await.expect("release");

    let err = m.uploads.upload_one(attr.ino).await.expect_err("refused");
    assert!(matches!(err, DriveError::InvalidContentType(ref mime) if mime == "image/png"));
    assert!(m.uploads.is_pending(attr.ino));
    assert!(uploaded_content(&h, "photo.png").is_none());
}

#[tokio::test]
async fn reopened_file_waits_for_its_last_writer() {
    let mut h = Harness::start().await;
    let m = h.mount_with_settle(Duration::from_millis(300)).await;

    let (attr, fh) = fs::create(&m.fs, ROOT_INODE, OsStr::new("log.txt"), 0o644).await.expect("create");
    fs::write(&m.fs, attr.ino, fh, 0, b"first-").await.expect("write");
    fs::release(&m.fs, attr.ino, fh).await.expect("release");

    // Reopened while the released file settles.
    let wfh = fs::open(&m.fs, attr.ino, libc::O_WRONLY).await.expect("reopen");
    assert_eq!(m.uploads.writers(attr.ino), 1);
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(m.uploads.is_pending(attr.ino));
    assert!(uploaded_content(&h, "log.txt").is_none());
    assert!(h.emulator.drive.lock().upload_offsets.is_empty());

    fs::write(&m.fs, attr.ino, wfh, 6, b"second").await.expect("write");
    fs::release(&m.fs, attr.ino, wfh).await.expect("release");
    let uploads = m.uploads.clone();
    assert!(eventually(|| !uploads.is_pending(attr.ino)).await);
    assert_eq!(uploaded_content(&h, "log.txt").as_deref(), Some(&b"first-second"[..]));
}

#[tokio::test]
async fn write_during_upload_trashes_the_stale_copy() {
    let mut h = Harness::start().await;
    let m = h.mount().await;
    let gate = h.emulator.upload_gate.write().await;

    let (attr, fh) = fs::create(&m.fs, ROOT_INODE, OsStr::new("log.txt"), 0o644).await.expect("create");
    fs::write(&m.fs, attr.ino, fh, 0, b"first-").await.expect("write");
    fs::release(&m.fs, attr.ino, fh).await.expect("release");
    let emulator = h.emulator.clone();
    assert!(eventually(|| emulator.parked_uploads.load(Ordering::SeqCst) == 1).await);

    let wfh = fs::open(&m.fs, attr.ino, libc::O_WRONLY).await.expect("reopen");
    fs::write(&m.fs, attr.ino, wfh, 6, b"second").await.expect("write");
    drop(gate);

    assert!(eventually(|| trashed_copies(&h, "log.txt") == 1).await);
    let uploads = m.uploads.clone();
    assert!(eventually(|| !uploads.is_uploading(attr.ino)).await);
    assert!(m.index.get(attr.ino).is_some_and(|n| n.remote_id.is_none()));
    assert!(m.uploads.is_pending(attr.ino));
    assert!(uploaded_content(&h, "log.txt").is_none());

    fs::release(&m.fs, attr.ino, wfh).await.expect("release");
    assert!(eventually(|| !uploads.is_pending(attr.ino)).await);
    assert_eq!(uploaded_content(&h, "log.txt").as_deref(), Some(&b"first-second"[..]));
    assert_eq!(trashed_copies(&h, "log.txt"), 1);
}

#[tokio::test]
async fn recreated_name_keeps_its_staging_file() {
    let mut h = Harness::start().await;
    let m = h.mount().await;
    let gate = h.emulator.upload_gate.write().await;

    let (old, fh) = fs::create(&m.fs, ROOT_INODE, OsStr::new("x.txt"), 0o644).await.expect("create");
    fs::write(&m.fs, old.ino, fh, 0, b"OLDOLD").await.expect("write");
    fs::release(&m.fs, old.ino, fh).await.expect("release");
    let emulator = h.emulator.clone();
    assert!(eventually(|| emulator.parked_uploads.load(Ordering::SeqCst) == 1).await);
    assert_eq!(h.emulator.drive.lock().open_sessions(), 1);

    fs::unlink(&m.fs, ROOT_INODE, OsStr::new("x.txt")).await.expect("unlink");
    let (new, nfh) = fs::create(&m.fs, ROOT_INODE, OsStr::new("x.txt"), 0o644).await.expect("recreate");
    fs::write(&m.fs, new.ino, nfh, 0, b"NEWNEW").await.expect("write");
    let staged = m.uploads.staged_path(new.ino).expect("staging path");
    drop(gate);

    // The unlinked file's upload finishes, is trashed, and leaves the new staging file alone.
    assert!(eventually(|| trashed_copies(&h, "x.txt") == 1).await);
    let uploads = m.uploads.clone();
    assert!(eventually(|| !uploads.is_uploading(old.ino)).await);
    assert!(staged.exists());
    let bytes = fs::read(&m.fs, new.ino, nfh, 0, 16).await.expect("staged read");
    assert_eq!(bytes.as_ref(), b"NEWNEW");

    fs::release(&m.fs, new.ino, nfh).await.expect("release");
    assert!(eventually(|| !uploads.is_pending(new.ino)).await);
    assert_eq!(uploaded_content(&h, "x.txt").as_deref(), Some(&b"NEWNEW"[..]));
}

#[tokio::test]
async fn refused_range_is_followed_by_an_offset_query() {
    let mut h = Harness::start().await;
    let m = h.mount().await;
    let data = pattern(10_000);

    let (attr, fh) = fs::create(&m.fs, ROOT_INODE, OsStr::new("notes.txt"), 0o644).await.expect("create");
    fs::write(&m.fs, attr.ino, fh, 0, &data).await.expect("write");
    let location = h.remote.create_upload_session(&session_request("notes.txt", data.len())).await.expect("session");
    let session_id = location.rsplit('/').next().expect("session id").to_string();
    h.emulator.drive.lock().put_session(&session_id, 0, &data[..4000]).expect("partial put");
    m.uploads.ledger().update(attr.ino, |entry| entry.location = Some(location.clone()));

    let gate = h.emulator.upload_gate.write().await;
    fs::release(&m.fs, attr.ino, fh).await.expect("release");
    let emulator = h.emulator.clone();
    assert!(eventually(|| emulator.parked_uploads.load(Ordering::SeqCst) == 1).await);
    assert_eq!(h.emulator.drive.lock().session_queries, 1);
    // The server loses what it held past byte 1000 before the next piece arrives.
    h.emulator.drive.lock().truncate_session(&session_id, 1000).expect("truncate");
    drop(gate);

    let uploads = m.uploads.clone();
    assert!(eventually(|| !uploads.is_pending(attr.ino)).await);
    let drive = h.emulator.drive.lock();
    assert_eq!(drive.upload_offsets, vec![0, 4000, 1000]);
    assert_eq!(drive.session_queries, 2);
    drop(drive);
    assert_eq!(uploaded_content(&h, "notes.txt").as_deref(), Some(data.as_slice()));
}

#[tokio::test]
async fn server_error_mid_upload_resumes_after_the_stored_bytes() {
    let mut h = Harness::start().await;
    let m = h.mount().await;
    let data = pattern(10_000);
    h.emulator.drive.lock().interrupt_after = Some(6000);

    let (attr, fh) = fs::create(&m.fs, ROOT_INODE, OsStr::new("big.bin"), 0o644).await.expect("create");
    fs::write(&m.fs, attr.ino, fh, 0, &data).await.expect("write");
    fs::release(&m.fs, attr.ino, fh).await.expect("release");

    let uploads = m.uploads.clone();
    assert!(eventually(|| !uploads.is_pending(attr.ino)).await);
    assert_eq!(h.emulator.drive.lock().upload_offsets, vec![0, 6000]);
    assert_eq!(uploaded_content(&h, "big.bin").as_deref(), Some(data.as_slice()));
}

#[tokio::test]
async fn rotated_token_is_reread_before_the_session_is_created() {
    let mut h = Harness::start().await;
    let token_path = h.config.data_dir().join("token.json");
    std::fs::write(&token_path, format!(r#"{{"access_token":"{}"}}"#, common::TOKEN)).expect("token file");
    let remote: Arc<dyn RemoteStore> = Arc::new(DriveClient::new(
        &h.config.api_url,
        &h.config.upload_url,
        Arc::new(FileTokenProvider::new(token_path.clone())),
    ));
    h.remote = remote;
    let m = h.mount().await;

    h.emulator.rotate_token("rotated");
    std::fs::write(&token_path, r#"{"access_token":"rotated"}"#).expect("token file");

    let (attr, fh) = fs::create(&m.fs, ROOT_INODE, OsStr::new("fresh.txt"), 0o644).await.expect("create");
    fs::write(&m.fs, attr.ino, fh, 0, b"hello").await.expect("write");
    fs::release(&m.fs, attr.ino, fh).await.expect("release");

    let uploads = m.uploads.clone();
    assert!(eventually(|| !uploads.is_pending(attr.ino)).await);
    assert_eq!(uploaded_content(&h, "fresh.txt").as_deref(), Some(&b"hello"[..]));
}

#[tokio::test]
async fn upload_whose_folder_vanished_lands_under_the_root() {
    let mut h = Harness::start().await;
    let m = h.mount().await;
    let inbox = fs::mkdir(&m.fs, ROOT_INODE, OsStr::new("inbox"), 0o755).await.expect("mkdir");
    let gate = h.emulator.upload_gate.write().await;

    let (attr, fh) = fs::create(&m.fs, inbox.ino, OsStr::new("late.txt"), 0o644).await.expect("create");
    fs::write(&m.fs, attr.ino, fh, 0, b"late").await.expect("write");
    fs::release(&m.fs, attr.ino, fh).await.expect("release");
    let emulator = h.emulator.clone();
    assert!(eventually(|| emulator.parked_uploads.load(Ordering::SeqCst) == 1).await);

    m.index.write(|tree| tree.delete(inbox.ino));
    drop(gate);

    let uploads = m.uploads.clone();
    assert!(eventually(|| !uploads.is_pending(attr.ino)).await);
    let landed = fs::lookup(&m.fs, ROOT_INODE, OsStr::new("late.txt")).await.expect("under root");
    assert_eq!(landed.size, 4);
    assert_eq!(uploaded_content(&h, "late.txt").as_deref(), Some(&b"late"[..]));
}
