//! This module defines the asynchronous client for the remote object store.
//!
//! The [`RemoteStore`] trait is the seam between the caching layers and HTTP:
//! the core only ever talks to a `dyn RemoteStore`, and [`DriveClient`] is the
//! `reqwest` implementation speaking the Drive v2 wire format. Tests swap in
//! an in-memory store.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::auth::TokenProvider;
use crate::error::DriveError;

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
pub const LIST_PAGE_SIZE: u32 = 500;

/// A file or folder as reported by the remote.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    pub id: String,
    pub title: String,
    pub mime_type: String,
    #[serde(default)]
    pub parents: Vec<ParentRef>,
    /// Drive encodes 64-bit integers as strings.
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    pub created_date: DateTime<Utc>,
    pub modified_date: DateTime<Utc>,
    #[serde(default)]
    pub editable: bool,
    #[serde(default)]
    pub labels: Labels,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    pub id: String,
    #[serde(default)]
    pub is_root: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Labels {
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub hidden: bool,
}

impl RemoteObject {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parents.first().map(|p| p.id.as_str())
    }

    /// Trashed or hidden objects never appear in the mount.
    pub fn is_visible(&self) -> bool {
        !self.labels.trashed && !self.labels.hidden
    }

    /// The title with NUL characters removed.
    pub fn display_name(&self) -> String {
        self.title.replace('\0', "")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub items: Vec<RemoteObject>,
    pub next_page_token: Option<String>,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeList {
    #[serde_as(as = "DisplayFromStr")]
    pub largest_change_id: u64,
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub items: Vec<Change>,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    #[serde_as(as = "DisplayFromStr")]
    pub id: u64,
    pub file_id: String,
    #[serde(default)]
    pub deleted: bool,
    pub file: Option<RemoteObject>,
}

/// Rename and/or move of a remote object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectPatch {
    pub title: Option<String>,
    pub add_parent: Option<String>,
    pub remove_parent: Option<String>,
}

/// Parameters of a new resumable upload session.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    pub parent_id: String,
    pub title: String,
    pub size: u64,
    pub mime_type: String,
}

/// Outcome of an upload attempt or an offset query.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadStatus {
    Complete(RemoteObject),
    /// The remote holds bytes `0..=last_byte`; `None` means nothing yet.
    Incomplete { last_byte: Option<u64> },
}

impl UploadStatus {
    /// Offset the next upload attempt starts from.
    pub fn resume_offset(&self) -> u64 {
        match self {
            UploadStatus::Incomplete { last_byte: Some(k) } => k + 1,
            _ => 0,
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Metadata of the remote root folder.
    async fn root(&self) -> Result<RemoteObject, DriveError>;
    async fn list_files(&self, page_token: Option<&str>) -> Result<FileList, DriveError>;
    async fn get_object(&self, id: &str) -> Result<RemoteObject, DriveError>;
    async fn insert_folder(&self, parent_id: &str, title: &str) -> Result<RemoteObject, DriveError>;
    async fn patch_object(&self, id: &str, patch: &ObjectPatch) -> Result<RemoteObject, DriveError>;
    async fn trash_object(&self, id: &str) -> Result<(), DriveError>;
    async fn list_changes(
        &self,
        start_change_id: Option<u64>,
        page_token: Option<&str>,
    ) -> Result<ChangeList, DriveError>;
    /// The newest change id, without fetching any change.
    async fn largest_change_id(&self) -> Result<u64, DriveError>;
    /// Fetches bytes `start..=end` of a download URL.
    async fn download_range(&self, url: &str, start: u64, end: u64) -> Result<Bytes, DriveError>;
    /// Opens a resumable session and returns its location.
    async fn create_upload_session(&self, request: &UploadRequest) -> Result<String, DriveError>;
    async fn query_upload_offset(&self, location: &str, size: u64) -> Result<UploadStatus, DriveError>;
    /// Sends `path[offset..size]` to the session at `location`.
    async fn upload_from(
        &self,
        location: &str,
        path: &Path,
        offset: u64,
        size: u64,
        mime_type: &str,
    ) -> Result<UploadStatus, DriveError>;
    async fn refresh_credentials(&self) -> Result<(), DriveError>;
}

/// The `reqwest` implementation of [`RemoteStore`].
pub struct DriveClient {
    client: Client,
    api_url: String,
    upload_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl DriveClient {
    pub fn new(api_url: &str, upload_url: &str, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            upload_url: upload_url.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    async fn bearer(&self) -> Result<String, DriveError> {
        self.tokens.access_token().await
    }
}

/// Maps a failed metadata API response onto the error taxonomy.
///
/// # Arguments
/// * `status` - The HTTP status of the response.
/// * `body` - The response body, used to tell rate limiting from refusals.
/// * `what` - Identifier reported in `NotFound`.
pub fn classify_api_error(status: StatusCode, body: String, what: &str) -> DriveError {
    match status.as_u16() {
        401 => DriveError::CredentialInvalid,
        404 => DriveError::NotFound(what.to_string()),
        403 if body.contains("RateLimitExceeded") || body.contains("rateLimitExceeded") => {
            DriveError::Server { status: 403, body }
        }
        429 | 500..=599 => DriveError::Server { status: status.as_u16(), body },
        code => DriveError::Rejected { status: code, body },
    }
}

/// Maps a failed signed-URL download onto the error taxonomy.
///
/// An empty 4xx body is how an expired signed URL presents itself.
pub fn classify_download_error(status: StatusCode, body: String) -> DriveError {
    match status.as_u16() {
        401 => DriveError::CredentialInvalid,
        400..=499 if body.trim().is_empty() => DriveError::CredentialExpired,
        400..=499 if body.contains("Invalid Credentials") => DriveError::CredentialInvalid,
        500..=599 => DriveError::Server { status: status.as_u16(), body },
        code => DriveError::Rejected { status: code, body },
    }
}

async fn check(response: Response, what: &str) -> Result<Response, DriveError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_api_error(status, body, what))
}

/// Parses the `Range: bytes=0-k` header of a 308 response.
pub fn parse_range_header(value: Option<&str>) -> Option<u64> {
    let value = value?;
    let (_, end) = value.trim().strip_prefix("bytes=")?.split_once('-')?;
    end.parse().ok()
}

/// Tells a refused `Content-Range` apart from other failed upload requests.
pub fn is_range_conflict(status: StatusCode, body: &str) -> bool {
    status == StatusCode::RANGE_NOT_SATISFIABLE
        || (status == StatusCode::BAD_REQUEST && body.contains("Content-Range"))
}

/// Interprets the answer to an upload-session PUT.
///
/// # Arguments
/// * `response` - The session's answer.
/// * `location` - The session URL, reported in `NotFound`.
/// * `offset` - First byte the request carried, or `None` for an offset query.
async fn upload_status(response: Response, location: &str, offset: Option<u64>) -> Result<UploadStatus, DriveError> {
    let status = response.status();
    match status.as_u16() {
        200 | 201 => Ok(UploadStatus::Complete(response.json().await?)),
        308 => {
            let range = response.headers().get(RANGE).and_then(|v| v.to_str().ok());
            Ok(UploadStatus::Incomplete { last_byte: parse_range_header(range) })
        }
        404 | 410 => Err(DriveError::NotFound(location.to_string())),
        _ => {
            let body = response.text().await.unwrap_or_default();
            match offset {
                Some(offset) if is_range_conflict(status, &body) => Err(DriveError::RangeMismatch { offset }),
                _ => Err(classify_api_error(status, body, location)),
            }
        }
    }
}

#[async_trait]
impl RemoteStore for DriveClient {
    async fn root(&self) -> Result<RemoteObject, DriveError> {
        self.get_object("root").await
    }

    async fn list_files(&self, page_token: Option<&str>) -> Result<FileList, DriveError> {
        let url = format!("{}/files", self.api_url);
        let mut query = vec![("maxResults", LIST_PAGE_SIZE.to_string())];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        debug!(page_token, "listing files");
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.bearer().await?)
            .query(&query)
            .send()
            .await?;
        Ok(check(response, "files").await?.json().await?)
    }

    async fn get_object(&self, id: &str) -> Result<RemoteObject, DriveError> {
        let url = format!("{}/files/{}", self.api_url, id);
        let response = self.client.get(&url).bearer_auth(self.bearer().await?).send().await?;
        Ok(check(response, id).await?.json().await?)
    }

    async fn insert_folder(&self, parent_id: &str, title: &str) -> Result<RemoteObject, DriveError> {
        let url = format!("{}/files", self.api_url);
        let body = serde_json::json!({
            "title": title,
            "mimeType": FOLDER_MIME,
            "parents": [{ "id": parent_id }],
        });
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.bearer().await?)
            .json(&body)
            .send()
            .await?;
        Ok(check(response, parent_id).await?.json().await?)
    }

    async fn patch_object(&self, id: &str, patch: &ObjectPatch) -> Result<RemoteObject, DriveError> {
        let url = format!("{}/files/{}", self.api_url, id);
        let mut query = Vec::new();
        if let Some(add) = &patch.add_parent {
            query.push(("addParents", add.clone()));
        }
        if let Some(remove) = &patch.remove_parent {
            query.push(("removeParents", remove.clone()));
        }
        let body = match &patch.title {
            Some(title) => serde_json::json!({ "title": title }),
            None => serde_json::json!({}),
        };
        let response = self
            .client
            .patch(&url)
            .bearer_auth(self.bearer().await?)
            .query(&query)
            .json(&body)
            .send()
            .await?;
        Ok(check(response, id).await?.json().await?)
    }

    async fn trash_object(&self, id: &str) -> Result<(), DriveError> {
        let url = format!("{}/files/{}/trash", self.api_url, id);
        let response = self.client.post(&url).bearer_auth(self.bearer().await?).send().await?;
        check(response, id).await?;
        Ok(())
    }

    async fn list_changes(
        &self,
        start_change_id: Option<u64>,
        page_token: Option<&str>,
    ) -> Result<ChangeList, DriveError> {
        let url = format!("{}/changes", self.api_url);
        let mut query = vec![
            ("maxResults", LIST_PAGE_SIZE.to_string()),
            ("includeSubscribed", "false".to_string()),
        ];
        if let Some(start) = start_change_id {
            query.push(("startChangeId", start.to_string()));
        }
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.bearer().await?)
            .query(&query)
            .send()
            .await?;
        Ok(check(response, "changes").await?.json().await?)
    }

    async fn largest_change_id(&self) -> Result<u64, DriveError> {
        #[serde_as]
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Largest {
            #[serde_as(as = "DisplayFromStr")]
            largest_change_id: u64,
        }

        let url = format!("{}/changes", self.api_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.bearer().await?)
            .query(&[("maxResults", "1"), ("fields", "largestChangeId")])
            .send()
            .await?;
        let largest: Largest = check(response, "changes").await?.json().await?;
        Ok(largest.largest_change_id)
    }

    async fn download_range(&self, url: &str, start: u64, end: u64) -> Result<Bytes, DriveError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(self.bearer().await?)
            .header(RANGE, format!("bytes={start}-{end}"))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_download_error(status, body));
        }
        Ok(response.bytes().await?)
    }

    async fn create_upload_session(&self, request: &UploadRequest) -> Result<String, DriveError> {
        let url = format!("{}/files?uploadType=resumable", self.upload_url);
        let body = serde_json::json!({
            "title": request.title,
            "mimeType": request.mime_type,
            "parents": [{ "id": request.parent_id }],
        });
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.bearer().await?)
            .header("X-Upload-Content-Type", &request.mime_type)
            .header("X-Upload-Content-Length", request.size.to_string())
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::BAD_REQUEST && body.contains("Media type") {
                return Err(DriveError::InvalidContentType(request.mime_type.clone()));
            }
            return Err(classify_api_error(status, body, &request.parent_id));
        }
        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| DriveError::Rejected {
                status: status.as_u16(),
                body: "upload session without location".to_string(),
            })
    }

    async fn query_upload_offset(&self, location: &str, size: u64) -> Result<UploadStatus, DriveError> {
        let response = self
            .client
            .put(location)
            .bearer_auth(self.bearer().await?)
            .header(CONTENT_RANGE, format!("bytes */{size}"))
            .header(CONTENT_LENGTH, 0)
            .send()
            .await?;
        upload_status(response, location, None).await
    }

    async fn upload_from(
        &self,
        location: &str,
        path: &Path,
        offset: u64,
        size: u64,
        mime_type: &str,
    ) -> Result<UploadStatus, DriveError> {
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let remaining = size.saturating_sub(offset);
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file.take(remaining)));

        debug!(location, offset, size, "uploading");
        let response = self
            .client
            .put(location)
            .bearer_auth(self.bearer().await?)
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .header(CONTENT_LENGTH, remaining)
            .header(CONTENT_RANGE, format!("bytes {}-{}/{}", offset, size.saturating_sub(1), size))
            .body(body)
            .send()
            .await?;
        upload_status(response, location, Some(offset)).await
    }

    async fn refresh_credentials(&self) -> Result<(), DriveError> {
        self.tokens.refresh().await.map(|_| ())
    }
}
