//! Resumable uploads of locally written files.
//!
//! A file created through the mount is staged under `upload/` and recorded
//! in the ledger. Once its last writer releases it, the engine pushes it
//! through the resumable upload protocol, writes the resulting remote
//! identity back into the metadata index and moves the bytes into the
//! chunk cache.

mod ledger;

pub use ledger::{LEDGER_FILE, PendingUpload, UploadLedger, staging_name};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::api_client::{RemoteObject, RemoteStore, UploadRequest, UploadStatus};
use crate::cache::{ChunkCache, SegmentKind, now_millis};
use crate::config::Config;
use crate::error::DriveError;
use crate::metadata::{MetadataIndex, Node, NodeKind};
use crate::retry::{Backoff, RetryPolicy, with_retries};

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub max_concurrent: usize,
    /// Window during which a staged file must keep its size before upload.
    pub settle_delay: Duration,
    /// Delay before a failed upload is queued again.
    pub requeue_delay: Duration,
    pub retry: RetryPolicy,
}

impl From<&Config> for UploadSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent: config.max_concurrent_uploads.max(1),
            settle_delay: config.upload_settle_delay(),
            requeue_delay: config.refresh_delay(),
            retry: RetryPolicy::background(),
        }
    }
}

/// Where one upload stands.
#[derive(Debug)]
enum UploadState {
    Idle,
    SessionRequested,
    /// Ask the session how much it already holds.
    Probing { location: String },
    Uploading { location: String, offset: u64 },
    Completed(RemoteObject),
}

/// What happened to one queued inode.
#[derive(Debug, PartialEq)]
pub enum UploadOutcome {
    Uploaded(String),
    /// Zero-length file: staging file dropped, nothing sent.
    Empty,
    /// Not released yet, or already gone from the ledger.
    Skipped,
    /// Still changing; try again after the delay.
    Requeue(Duration),
    /// Unlinked while the upload ran; the remote copy was trashed.
    Discarded,
    /// Opened for writing while the upload ran; the stale remote copy was
    /// trashed and the file waits for its next release.
    Superseded,
}

#[derive(Debug, Default, PartialEq)]
pub struct ResumeReport {
    pub requeued: usize,
    pub discarded: usize,
    pub adopted: usize,
}

pub struct UploadEngine {
    remote: Arc<dyn RemoteStore>,
    index: Arc<MetadataIndex>,
    cache: Arc<ChunkCache>,
    ledger: Arc<UploadLedger>,
    staging_dir: PathBuf,
    settings: UploadSettings,
    permits: Arc<Semaphore>,
    in_progress: DashSet<u64>,
    /// Inodes released again while their upload was running.
    requeue: DashSet<u64>,
    /// Open writable handles per pending inode.
    writers: DashMap<u64, usize>,
    /// Bumped on every write open; an upload that started under an older
    /// generation carries stale content.
    generations: DashMap<u64, u64>,
}

impl UploadEngine {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        index: Arc<MetadataIndex>,
        cache: Arc<ChunkCache>,
        ledger: Arc<UploadLedger>,
        staging_dir: PathBuf,
        settings: UploadSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            index,
            cache,
            ledger,
            staging_dir,
            permits: Arc::new(Semaphore::new(settings.max_concurrent)),
            settings,
            in_progress: DashSet::new(),
            requeue: DashSet::new(),
            writers: DashMap::new(),
            generations: DashMap::new(),
        })
    }

    pub fn ledger(&self) -> &Arc<UploadLedger> {
        &self.ledger
    }

    pub fn staging_path(&self, cache: &str) -> PathBuf {
        self.staging_dir.join(cache)
    }

    /// Staging file of a pending inode.
    pub fn staged_path(&self, inode: u64) -> Option<PathBuf> {
        self.ledger.get(inode).map(|e| self.staging_path(&e.cache))
    }

    pub fn is_pending(&self, inode: u64) -> bool {
        self.ledger.contains(inode)
    }

    /// Registers a writable handle on a pending file. The file is withheld
    /// from upload until every writer has released it, and a session opened
    /// for the earlier content is abandoned. Returns false when the inode has
    /// no pending upload.
    pub fn open_writer(&self, inode: u64) -> bool {
        let known = self.ledger.update(inode, |entry| {
            entry.released = false;
            entry.location = None;
        });
        if !known {
            return false;
        }
        *self.writers.entry(inode).or_insert(0) += 1;
        self.touch(inode);
        true
    }

    /// Number of writable handles open on `inode`.
    pub fn writers(&self, inode: u64) -> usize {
        self.writers.get(&inode).map_or(0, |n| *n)
    }

    /// True while an upload attempt for `inode` is running.
    pub fn is_uploading(&self, inode: u64) -> bool {
        self.in_progress.contains(&inode)
    }

    /// Marks the staged content of `inode` as changed outside a write handle.
    pub fn touch(&self, inode: u64) {
        *self.generations.entry(inode).or_insert(0) += 1;
    }

    fn generation(&self, inode: u64) -> u64 {
        self.generations.get(&inode).map_or(0, |g| *g)
    }

    /// True while `inode` is released, has no writer and was not written
    /// since `generation`.
    fn unchanged_since(&self, inode: u64, generation: u64) -> bool {
        self.ledger.get(inode).is_some_and(|e| e.released)
            && self.writers(inode) == 0
            && self.generation(inode) == generation
    }

    /// Creates an empty staging file for a new local file and records it.
    ///
    /// # Arguments
    /// * `inode` - The local node that will receive the upload result.
    /// * `parent_id` - Remote id of the destination folder.
    /// * `name` - File name inside that folder.
    pub async fn stage(&self, inode: u64, parent_id: &str, name: &str) -> Result<PathBuf, DriveError> {
        let cache = staging_name(parent_id, name);
        let path = self.staging_path(&cache);
        tokio::fs::File::create(&path).await?;
        self.cache.segments().record(&cache, 0, SegmentKind::Uploading, now_millis())?;
        self.ledger.insert(
            inode,
            PendingUpload {
                cache,
                location: None,
                released: false,
                parent_id: parent_id.to_string(),
                name: name.to_string(),
            },
        );
        debug!(inode, parent_id, name, "staged new file");
        Ok(path)
    }

    /// Drops one writer of a staged file. Once the last writer is gone the
    /// file is marked complete and queued.
    pub fn release(self: &Arc<Self>, inode: u64) {
        let remaining = self
            .writers
            .get_mut(&inode)
            .map(|mut n| {
                *n = n.saturating_sub(1);
                *n
            })
            .unwrap_or(0);
        if remaining > 0 {
            debug!(inode, remaining, "released, other writers still open");
            return;
        }
        self.writers.remove_if(&inode, |_, n| *n == 0);

        let running = self.in_progress.contains(&inode);
        if !self.ledger.update(inode, |entry| entry.released = true) {
            return;
        }
        if let Some(entry) = self.ledger.get(inode) {
            if let Ok(meta) = std::fs::metadata(self.staging_path(&entry.cache)) {
                if let Err(e) =
                    self.cache.segments().record(&entry.cache, meta.len(), SegmentKind::Uploading, now_millis())
                {
                    warn!(inode, error = %e, "cannot record staged size");
                }
            }
        }
        if running {
            self.requeue.insert(inode);
        } else {
            self.enqueue(inode);
        }
    }

    /// Queues an upload in the background.
    pub fn enqueue(self: &Arc<Self>, inode: u64) {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.process(inode).await });
    }

    async fn process(self: Arc<Self>, inode: u64) {
        if !self.in_progress.insert(inode) {
            self.requeue.insert(inode);
            return;
        }
        let outcome = {
            let _permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    self.in_progress.remove(&inode);
                    return;
                }
            };
            self.upload_one(inode).await
        };
        self.in_progress.remove(&inode);

        let retry_after = match outcome {
            Ok(UploadOutcome::Requeue(delay)) => Some(delay),
            Ok(UploadOutcome::Superseded) => {
                if matches!(self.withheld(inode), UploadOutcome::Requeue(_)) {
                    self.requeue.insert(inode);
                }
                None
            }
            Ok(outcome) => {
                debug!(inode, ?outcome, "upload finished");
                None
            }
            Err(DriveError::InvalidContentType(mime)) => {
                error!(inode, %mime, "remote refuses this content type; upload stays pending");
                None
            }
            Err(e) if e.is_transient() || matches!(e, DriveError::CredentialInvalid) => {
                warn!(inode, error = %e, "upload failed, will retry");
                Some(self.settings.requeue_delay)
            }
            Err(e) => {
                error!(inode, error = %e, "upload failed");
                None
            }
        };

        let again = self.requeue.remove(&inode).is_some();
        if let Some(delay) = retry_after {
            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                engine.enqueue(inode);
            });
        } else if again {
            self.enqueue(inode);
        }
    }

    /// Runs one upload attempt for `inode` to completion.
    pub async fn upload_one(&self, inode: u64) -> Result<UploadOutcome, DriveError> {
        let Some(entry) = self.ledger.get(inode) else {
            return Ok(UploadOutcome::Skipped);
        };
        if !entry.released || self.writers(inode) > 0 {
            return Ok(UploadOutcome::Skipped);
        }
        let generation = self.generation(inode);
        let path = self.staging_path(&entry.cache);
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(inode, cache = %entry.cache, "staging file vanished, dropping upload");
                self.ledger.remove(inode);
                self.cache.segments().remove(&entry.cache)?;
                return Ok(UploadOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        if size == 0 {
            info!(inode, name = %entry.name, "empty file, nothing to upload");
            self.drop_staging(inode, &entry).await;
            self.ledger.remove(inode);
            return Ok(UploadOutcome::Empty);
        }

        if !self.settings.settle_delay.is_zero() {
            tokio::time::sleep(self.settings.settle_delay).await;
            let settled = tokio::fs::metadata(&path).await?.len();
            if settled != size {
                debug!(inode, size, settled, "file still changing, requeueing");
                return Ok(UploadOutcome::Requeue(Duration::ZERO));
            }
            if !self.ledger.contains(inode) {
                debug!(inode, "file removed while settling");
                self.drop_staging(inode, &entry).await;
                return Ok(UploadOutcome::Discarded);
            }
            if !self.unchanged_since(inode, generation) {
                debug!(inode, "file reopened for writing while settling");
                return Ok(self.withheld(inode));
            }
        }

        // Renames while the file was pending are reflected in the node.
        let (parent_id, name) = match self.index.get(inode) {
            Some(node) => (node.parent_id.unwrap_or(entry.parent_id.clone()), node.name),
            None => (entry.parent_id.clone(), entry.name.clone()),
        };
        let mime_type = mime_guess::from_path(&name).first_or_octet_stream().essence_str().to_string();
        let request = UploadRequest { parent_id, title: name, size, mime_type };

        let object = match self.drive(inode, entry.location.clone(), &request, &path).await {
            Ok(object) => object,
            Err(e) => {
                if !self.unchanged_since(inode, generation) {
                    self.ledger.update(inode, |entry| entry.location = None);
                }
                return Err(e);
            }
        };
        self.reconcile(inode, &entry, object, &path, size, generation).await
    }

    /// Walks the state machine until the remote holds the whole file.
    async fn drive(
        &self,
        inode: u64,
        location: Option<String>,
        request: &UploadRequest,
        path: &Path,
    ) -> Result<RemoteObject, DriveError> {
        let remote = self.remote.as_ref();
        let mut backoff = Backoff::new(self.settings.retry.base, self.settings.retry.cap);
        let mut failures = 0;
        let mut state = match location {
            Some(location) => UploadState::Probing { location },
            None => UploadState::Idle,
        };

        loop {
            debug!(inode, ?state, "upload step");
            state = match state {
                UploadState::Idle => UploadState::SessionRequested,
                UploadState::SessionRequested => {
                    let location = with_retries(remote, &self.settings.retry, "create upload session", || {
                        remote.create_upload_session(request)
                    })
                    .await?;
                    let saved = location.clone();
                    self.ledger.update(inode, |e| e.location = Some(saved));
                    UploadState::Uploading { location, offset: 0 }
                }
                UploadState::Probing { location } => {
                    let probed = remote.query_upload_offset(&location, request.size).await;
                    match probed {
                        Ok(UploadStatus::Complete(object)) => UploadState::Completed(object),
                        Ok(status) => UploadState::Uploading { offset: status.resume_offset(), location },
                        Err(DriveError::NotFound(_)) | Err(DriveError::Rejected { .. }) => {
                            warn!(inode, "upload session unusable, starting a new one");
                            self.ledger.update(inode, |e| e.location = None);
                            UploadState::SessionRequested
                        }
                        Err(e) => {
                            self.absorb_failure(e, &mut failures, &mut backoff).await?;
                            UploadState::Probing { location }
                        }
                    }
                }
                UploadState::Uploading { location, offset } => {
                    let sent = remote.upload_from(&location, path, offset, request.size, &request.mime_type).await;
                    match sent {
                        Ok(UploadStatus::Complete(object)) => UploadState::Completed(object),
                        Ok(UploadStatus::Incomplete { last_byte }) => {
                            debug!(inode, ?last_byte, "upload incomplete, querying offset");
                            UploadState::Probing { location }
                        }
                        Err(DriveError::NotFound(_)) => {
                            self.ledger.update(inode, |e| e.location = None);
                            UploadState::SessionRequested
                        }
                        Err(e) => {
                            // Never restart blindly: ask the session first.
                            self.absorb_failure(e, &mut failures, &mut backoff).await?;
                            UploadState::Probing { location }
                        }
                    }
                }
                UploadState::Completed(object) => return Ok(object),
            };
        }
    }

    /// Waits out a recoverable failure or returns it when it is permanent or
    /// the attempt budget is spent.
    async fn absorb_failure(&self, err: DriveError, failures: &mut u32, backoff: &mut Backoff) -> Result<(), DriveError> {
        *failures += 1;
        if *failures >= self.settings.retry.max_attempts {
            return Err(err);
        }
        match err {
            DriveError::CredentialInvalid => self.remote.refresh_credentials().await,
            DriveError::RangeMismatch { .. } => Ok(()),
            e if e.is_transient() => {
                let delay = backoff.next_delay();
                warn!(error = %e, ?delay, "upload interrupted, resuming after delay");
                tokio::time::sleep(delay).await;
                Ok(())
            }
            e => Err(e),
        }
    }

    /// What to do with a file that may not be uploaded right now: a released
    /// file without writers is queued again, anything else waits for its
    /// last writer.
    fn withheld(&self, inode: u64) -> UploadOutcome {
        if self.ledger.get(inode).is_some_and(|e| e.released) && self.writers(inode) == 0 {
            UploadOutcome::Requeue(Duration::ZERO)
        } else {
            UploadOutcome::Skipped
        }
    }

    async fn trash_upload(&self, remote_id: &str) {
        if let Err(e) = self.remote.trash_object(remote_id).await {
            warn!(remote_id, error = %e, "cannot trash stale upload");
        }
    }

    /// Writes the upload result back into the index and the cache.
    ///
    /// # Arguments
    /// * `entry` - The ledger entry the upload started from.
    /// * `generation` - Write generation the uploaded bytes belong to.
    async fn reconcile(
        &self,
        inode: u64,
        entry: &PendingUpload,
        object: RemoteObject,
        path: &Path,
        size: u64,
        generation: u64,
    ) -> Result<UploadOutcome, DriveError> {
        if !self.ledger.contains(inode) {
            info!(inode, remote_id = %object.id, "file removed during upload, trashing remote copy");
            self.trash_upload(&object.id).await;
            self.drop_staging(inode, entry).await;
            return Ok(UploadOutcome::Discarded);
        }
        if !self.unchanged_since(inode, generation) {
            info!(inode, remote_id = %object.id, "file written during upload, trashing stale copy");
            self.trash_upload(&object.id).await;
            self.ledger.update(inode, |e| e.location = None);
            return Ok(UploadOutcome::Superseded);
        }

        let remote_id = object.id.clone();
        self.index.write(|tree| {
            let existing = tree.get(inode).filter(|n| !n.is_folder()).is_some();
            if !existing {
                warn!(inode, remote_id = %object.id, "uploaded file has no local node, inserting");
                tree.insert(Node::from_remote(&object));
                return;
            }
            tree.assign_remote_id(inode, &object.id);
            if let Some(node) = tree.get_mut(inode) {
                node.ctime = object.created_date.timestamp_millis();
                node.mtime = object.modified_date.timestamp_millis();
                node.editable = object.editable;
                node.kind = NodeKind::File {
                    size: object.file_size.unwrap_or(size),
                    download_url: object.download_url.clone(),
                };
            }
            let current_parent = tree.get(inode).and_then(|n| n.parent_id.clone());
            match object.parent_id() {
                Some(parent) if !tree.parent_known(Some(parent)) => {
                    warn!(inode, parent, "destination folder vanished, moving upload under root");
                    tree.reparent(inode, parent);
                }
                Some(parent) if current_parent.as_deref() != Some(parent) => {
                    tree.reparent(inode, parent);
                }
                _ => {}
            }
        });

        if let Err(e) = self.cache.import_staged(&remote_id, size, path).await {
            warn!(remote_id = %remote_id, error = %e, "cannot import upload into cache");
        }
        self.drop_staging(inode, entry).await;
        self.ledger.remove(inode);
        self.generations.remove(&inode);
        info!(inode, remote_id = %remote_id, size, "upload complete");
        Ok(UploadOutcome::Uploaded(remote_id))
    }

    /// Removes the staging file of `inode`, unless another inode has since
    /// been staged under the same content address.
    async fn drop_staging(&self, inode: u64, entry: &PendingUpload) {
        if let Some(owner) = self.ledger.owner_of(&entry.cache).filter(|owner| *owner != inode) {
            debug!(inode, owner, cache = %entry.cache, "staging file now belongs to another file, keeping it");
            return;
        }
        let path = self.staging_path(&entry.cache);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "cannot remove staging file");
            }
        }
        if let Err(e) = self.cache.segments().remove(&entry.cache) {
            warn!(cache = %entry.cache, error = %e, "cannot drop staged segment record");
        }
    }

    /// Forgets a pending upload whose file was unlinked. A running upload
    /// notices on completion and trashes its result.
    pub async fn discard(&self, inode: u64) {
        let Some(entry) = self.ledger.remove(inode) else {
            return;
        };
        self.writers.remove(&inode);
        self.generations.remove(&inode);
        if !self.in_progress.contains(&inode) {
            self.drop_staging(inode, &entry).await;
        }
    }

    /// Follows a rename of a pending file so that the upload lands under the
    /// new name and the staging file keeps its content address.
    pub async fn relocate(&self, inode: u64, parent_id: &str, name: &str) -> Result<(), DriveError> {
        let Some(entry) = self.ledger.get(inode) else {
            return Ok(());
        };
        let cache = staging_name(parent_id, name);
        let running = self.in_progress.contains(&inode);
        if !running && cache != entry.cache {
            tokio::fs::rename(self.staging_path(&entry.cache), self.staging_path(&cache)).await?;
            let size = self.cache.segments().size_of(&entry.cache)?.unwrap_or(0);
            self.cache.segments().remove(&entry.cache)?;
            self.cache.segments().record(&cache, size, SegmentKind::Uploading, now_millis())?;
        }
        self.ledger.update(inode, |e| {
            e.parent_id = parent_id.to_string();
            e.name = name.to_string();
            if !running {
                e.cache = cache.clone();
            }
        });
        Ok(())
    }

    /// Picks up where a previous run stopped.
    ///
    /// Released entries are queued again; unreleased ones were being written
    /// when the process died and are discarded with their local node. Staged
    /// files the ledger does not know are matched to a local node by content
    /// address and size and queued as released.
    pub async fn resume(self: &Arc<Self>) -> Result<ResumeReport, DriveError> {
        // No handle outlives the process that opened it.
        self.writers.clear();
        let mut report = ResumeReport::default();
        for (inode, entry) in self.ledger.entries() {
            if entry.released {
                self.enqueue(inode);
                report.requeued += 1;
            } else {
                info!(inode, name = %entry.name, "discarding unreleased upload");
                self.drop_staging(inode, &entry).await;
                self.ledger.remove(inode);
                self.index.write(|tree| {
                    if tree.get(inode).is_some_and(|n| n.remote_id.is_none()) {
                        tree.delete(inode);
                    }
                });
                report.discarded += 1;
            }
        }

        let mut dir = tokio::fs::read_dir(&self.staging_dir).await?;
        while let Some(file) = dir.next_entry().await? {
            let cache = file.file_name().to_string_lossy().into_owned();
            if self.ledger.is_tracked(&cache) {
                continue;
            }
            let size = file.metadata().await?.len();
            let candidate = self.index.read(|tree| {
                tree.iter()
                    .filter(|n| n.remote_id.is_none() && !n.is_folder() && n.size() == size)
                    .find(|n| {
                        n.parent_id.as_deref().is_some_and(|p| staging_name(p, &n.name) == cache)
                    })
                    .map(|n| (n.inode, n.parent_id.clone().unwrap_or_default(), n.name.clone()))
            });
            match candidate {
                Some((inode, parent_id, name)) => {
                    info!(inode, %name, "adopting untracked staging file");
                    self.cache.segments().record(&cache, size, SegmentKind::Uploading, now_millis())?;
                    self.ledger.insert(inode, PendingUpload { cache, location: None, released: true, parent_id, name });
                    self.enqueue(inode);
                    report.adopted += 1;
                }
                None => debug!(%cache, "staging file matches no local file"),
            }
        }
        Ok(report)
    }
}
