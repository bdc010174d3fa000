//! In-memory object store behind the emulator.
//!
//! Every mutation appends to the change log, so the change feed always
//! reflects the store exactly.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
pub const ROOT_ID: &str = "root-folder";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parent {
    pub id: String,
    pub is_root: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Labels {
    pub trashed: bool,
    pub hidden: bool,
}

/// Object metadata in the wire shape of the Drive v2 API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub title: String,
    pub mime_type: String,
    pub parents: Vec<Parent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    pub created_date: DateTime<Utc>,
    pub modified_date: DateTime<Utc>,
    pub editable: bool,
    pub labels: Labels,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    pub id: String,
    pub file_id: String,
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<DriveFile>,
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub parent_id: String,
    pub title: String,
    pub mime_type: String,
    pub size: u64,
    pub received: Vec<u8>,
}

/// Result of a `PUT` on an upload session.
#[derive(Debug)]
pub enum SessionState {
    /// Bytes `0..=last` are stored; `None` when nothing is.
    Partial(Option<u64>),
    Complete(DriveFile),
}

#[derive(Debug, PartialEq)]
pub enum StoreError {
    NotFound,
    BadRequest(String),
    /// The bytes offered do not continue what the session holds.
    RangeConflict { held: u64 },
    /// The connection dropped after part of the body was stored.
    Interrupted,
}

pub struct DriveState {
    base_url: String,
    files: BTreeMap<String, DriveFile>,
    contents: HashMap<String, Vec<u8>>,
    changes: Vec<ChangeEntry>,
    sessions: HashMap<String, UploadSession>,
    /// Media types refused at session creation.
    pub refused_media: Vec<String>,
    /// Start offset of every byte-carrying session `PUT`, in arrival order.
    pub upload_offsets: Vec<u64>,
    /// Signature generation of download URLs; older URLs are refused.
    url_epoch: u64,
    /// When set, the next byte-carrying `PUT` stores only this many bytes
    /// and fails.
    pub interrupt_after: Option<usize>,
    /// Offset queries (`bytes */N`) answered so far.
    pub session_queries: u64,
}

impl DriveState {
    /// # Arguments
    /// * `base_url` - Address clients reach the emulator at; download URLs
    ///   and upload session locations are built from it.
    pub fn new(base_url: &str) -> Self {
        let now = Utc::now();
        let root = DriveFile {
            id: ROOT_ID.to_string(),
            title: "My Drive".to_string(),
            mime_type: FOLDER_MIME.to_string(),
            parents: Vec::new(),
            file_size: None,
            download_url: None,
            created_date: now,
            modified_date: now,
            editable: true,
            labels: Labels::default(),
        };
        let mut files = BTreeMap::new();
        files.insert(ROOT_ID.to_string(), root);
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            files,
            contents: HashMap::new(),
            changes: Vec::new(),
            sessions: HashMap::new(),
            refused_media: Vec::new(),
            upload_offsets: Vec::new(),
            url_epoch: 0,
            interrupt_after: None,
            session_queries: 0,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn resolve<'a>(&self, id: &'a str) -> &'a str {
        if id == "root" { ROOT_ID } else { id }
    }

    fn record(&mut self, file_id: &str, deleted: bool) {
        let id = (self.changes.len() + 1).to_string();
        let file = if deleted { None } else { self.files.get(file_id).cloned() };
        self.changes.push(ChangeEntry { id, file_id: file_id.to_string(), deleted, file });
    }

    pub fn largest_change_id(&self) -> u64 {
        self.changes.len() as u64
    }

    pub fn get(&self, id: &str) -> Option<&DriveFile> {
        self.files.get(self.resolve(id))
    }

    pub fn url_epoch(&self) -> u64 {
        self.url_epoch
    }

    fn signed_url(&self, id: &str) -> String {
        match self.url_epoch {
            0 => format!("{}/download/{}", self.base_url, id),
            epoch => format!("{}/download/{}?sig={}", self.base_url, id, epoch),
        }
    }

    /// Invalidates every download URL handed out so far. Object metadata
    /// carries the new URLs; no change is recorded.
    pub fn expire_download_urls(&mut self) {
        self.url_epoch += 1;
        let ids: Vec<String> =
            self.files.values().filter(|f| f.download_url.is_some()).map(|f| f.id.clone()).collect();
        for id in ids {
            let url = self.signed_url(&id);
            if let Some(file) = self.files.get_mut(&id) {
                file.download_url = Some(url);
            }
        }
    }

    /// Resumable sessions not completed yet.
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn content(&self, id: &str) -> Option<&[u8]> {
        self.contents.get(id).map(Vec::as_slice)
    }

    fn new_object(&self, parent_id: &str, title: &str, mime_type: &str) -> DriveFile {
        let now = Utc::now();
        DriveFile {
            id: Uuid::new_v4().simple().to_string(),
            title: title.to_string(),
            mime_type: mime_type.to_string(),
            parents: vec![Parent { id: parent_id.to_string(), is_root: parent_id == ROOT_ID }],
            file_size: None,
            download_url: None,
            created_date: now,
            modified_date: now,
            editable: true,
            labels: Labels::default(),
        }
    }

    fn check_parent(&self, parent_id: &str) -> Result<String, StoreError> {
        let parent_id = self.resolve(parent_id).to_string();
        match self.files.get(&parent_id) {
            Some(parent) if parent.is_folder() && !parent.labels.trashed => Ok(parent_id),
            Some(_) => Err(StoreError::BadRequest(format!("{parent_id} is not a folder"))),
            None => Err(StoreError::NotFound),
        }
    }

    pub fn insert_folder(&mut self, parent_id: &str, title: &str) -> Result<DriveFile, StoreError> {
        let parent_id = self.check_parent(parent_id)?;
        let folder = self.new_object(&parent_id, title, FOLDER_MIME);
        self.files.insert(folder.id.clone(), folder.clone());
        self.record(&folder.id, false);
        Ok(folder)
    }

    /// Stores a complete file, as an upload would.
    pub fn insert_file(&mut self, parent_id: &str, title: &str, mime_type: &str, bytes: Vec<u8>) -> Result<DriveFile, StoreError> {
        let parent_id = self.check_parent(parent_id)?;
        let mut file = self.new_object(&parent_id, title, mime_type);
        file.file_size = Some(bytes.len().to_string());
        file.download_url = Some(self.signed_url(&file.id));
        self.contents.insert(file.id.clone(), bytes);
        self.files.insert(file.id.clone(), file.clone());
        self.record(&file.id, false);
        Ok(file)
    }

    /// Renames and/or moves an object.
    pub fn patch(
        &mut self,
        id: &str,
        title: Option<String>,
        add_parent: Option<&str>,
        remove_parent: Option<&str>,
    ) -> Result<DriveFile, StoreError> {
        let id = self.resolve(id).to_string();
        let add_parent = match add_parent {
            Some(parent) => Some(self.check_parent(parent)?),
            None => None,
        };
        let file = self.files.get_mut(&id).ok_or(StoreError::NotFound)?;
        if let Some(title) = title {
            file.title = title;
        }
        if let Some(remove) = remove_parent {
            file.parents.retain(|p| p.id != remove);
        }
        if let Some(add) = add_parent {
            if !file.parents.iter().any(|p| p.id == add) {
                file.parents.insert(0, Parent { is_root: add == ROOT_ID, id: add });
            }
        }
        file.modified_date = Utc::now();
        let file = file.clone();
        self.record(&id, false);
        Ok(file)
    }

    /// Sets the hidden label of an object.
    pub fn set_hidden(&mut self, id: &str, hidden: bool) -> Result<(), StoreError> {
        let id = self.resolve(id).to_string();
        let file = self.files.get_mut(&id).ok_or(StoreError::NotFound)?;
        file.labels.hidden = hidden;
        file.modified_date = Utc::now();
        self.record(&id, false);
        Ok(())
    }

    /// Trashes an object and, for a folder, everything below it.
    pub fn trash(&mut self, id: &str) -> Result<(), StoreError> {
        let id = self.resolve(id).to_string();
        if id == ROOT_ID {
            return Err(StoreError::BadRequest("the root cannot be trashed".to_string()));
        }
        if !self.files.contains_key(&id) {
            return Err(StoreError::NotFound);
        }
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            let children: Vec<String> = self
                .files
                .values()
                .filter(|f| f.parents.iter().any(|p| p.id == current) && !f.labels.trashed)
                .map(|f| f.id.clone())
                .collect();
            pending.extend(children);
            if let Some(file) = self.files.get_mut(&current) {
                file.labels.trashed = true;
                file.modified_date = Utc::now();
            }
            self.record(&current, false);
        }
        Ok(())
    }

    /// Removes an object for good; the change feed reports it as deleted.
    pub fn delete(&mut self, id: &str) -> Result<(), StoreError> {
        let id = self.resolve(id).to_string();
        self.files.remove(&id).ok_or(StoreError::NotFound)?;
        self.contents.remove(&id);
        self.record(&id, true);
        Ok(())
    }

    /// One page of the object listing; the page token is an offset.
    pub fn list(&self, max_results: usize, page_token: Option<&str>) -> (Vec<DriveFile>, Option<String>) {
        let start: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let all: Vec<&DriveFile> = self.files.values().filter(|f| f.id != ROOT_ID).collect();
        let end = (start + max_results.max(1)).min(all.len());
        let items = all.get(start..end).unwrap_or_default().iter().map(|f| (*f).clone()).collect();
        let next = (end < all.len()).then(|| end.to_string());
        (items, next)
    }

    /// One page of the change feed starting at `start_change_id`.
    pub fn changes(
        &self,
        start_change_id: u64,
        max_results: usize,
        page_token: Option<&str>,
    ) -> (Vec<ChangeEntry>, Option<String>) {
        let from = page_token
            .and_then(|t| t.parse::<u64>().ok())
            .unwrap_or(start_change_id)
            .max(1);
        let skip = (from - 1) as usize;
        let items: Vec<ChangeEntry> = self.changes.iter().skip(skip).take(max_results.max(1)).cloned().collect();
        let consumed = skip + items.len();
        let next = (consumed < self.changes.len()).then(|| (consumed + 1).to_string());
        (items, next)
    }

    /// Opens a resumable session and returns its id.
    pub fn create_session(&mut self, parent_id: &str, title: &str, mime_type: &str, size: u64) -> Result<String, StoreError> {
        if self.refused_media.iter().any(|m| m == mime_type) {
            return Err(StoreError::BadRequest(format!("Media type '{mime_type}' is not supported.")));
        }
        let parent_id = self.check_parent(parent_id)?;
        let session_id = Uuid::new_v4().simple().to_string();
        self.sessions.insert(
            session_id.clone(),
            UploadSession {
                parent_id,
                title: title.to_string(),
                mime_type: mime_type.to_string(),
                size,
                received: Vec::new(),
            },
        );
        Ok(session_id)
    }

    pub fn session(&self, session_id: &str) -> Option<&UploadSession> {
        self.sessions.get(session_id)
    }

    /// Forgets everything a session holds past `keep` bytes, as a server
    /// that lost uncommitted data would.
    pub fn truncate_session(&mut self, session_id: &str, keep: usize) -> Result<(), StoreError> {
        let session = self.sessions.get_mut(session_id).ok_or(StoreError::NotFound)?;
        session.received.truncate(keep);
        Ok(())
    }

    /// State of a session without sending bytes.
    pub fn query_session(&mut self, session_id: &str) -> Result<SessionState, StoreError> {
        self.session_queries += 1;
        let session = self.sessions.get(session_id).ok_or(StoreError::NotFound)?;
        Ok(SessionState::Partial(last_byte(&session.received)))
    }

    /// Accepts bytes starting at `offset`. The session completes once it
    /// holds `size` bytes.
    pub fn put_session(&mut self, session_id: &str, offset: u64, bytes: &[u8]) -> Result<SessionState, StoreError> {
        let session = self.sessions.get_mut(session_id).ok_or(StoreError::NotFound)?;
        self.upload_offsets.push(offset);
        let held = session.received.len() as u64;
        if offset > held {
            return Err(StoreError::RangeConflict { held });
        }
        session.received.truncate(offset as usize);
        let room = session.size.saturating_sub(offset) as usize;
        if let Some(stored) = self.interrupt_after.take() {
            session.received.extend_from_slice(&bytes[..bytes.len().min(room).min(stored)]);
            return Err(StoreError::Interrupted);
        }
        session.received.extend_from_slice(&bytes[..bytes.len().min(room)]);
        if (session.received.len() as u64) < session.size {
            return Ok(SessionState::Partial(last_byte(&session.received)));
        }

        let Some(session) = self.sessions.remove(session_id) else {
            return Err(StoreError::NotFound);
        };
        let file = self.insert_file(&session.parent_id, &session.title, &session.mime_type, session.received)?;
        Ok(SessionState::Complete(file))
    }
}

fn last_byte(received: &[u8]) -> Option<u64> {
    (!received.is_empty()).then(|| received.len() as u64 - 1)
}
