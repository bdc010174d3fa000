//! HTTP handlers for the emulated API surface.
//!
//! Every handler checks the bearer token, takes the store lock for the
//! duration of one synchronous mutation and answers in the Drive v2 JSON
//! shape the client parses.

use std::sync::atomic::Ordering;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::SharedState;
use crate::state::{ChangeEntry, DriveFile, SessionState, StoreError};

const DEFAULT_PAGE_SIZE: usize = 100;

/// Error answered with a Drive-style JSON body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ApiError::new(StatusCode::NOT_FOUND, "File not found"),
            StoreError::BadRequest(message) => ApiError::new(StatusCode::BAD_REQUEST, message),
            StoreError::RangeConflict { held } => {
                ApiError::new(StatusCode::BAD_REQUEST, format!("Invalid Content-Range: session holds {held} bytes"))
            }
            StoreError::Interrupted => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "Backend Error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": { "code": self.status.as_u16(), "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

/// Rejects requests without the configured bearer token, and answers 503
/// while injected failures remain.
fn admit(app: &crate::AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let expected = app.token.read().clone();
    if let Some(expected) = expected {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected.as_str()) {
            return Err(ApiError::new(StatusCode::UNAUTHORIZED, "Invalid Credentials"));
        }
    }
    let pending = app.failures.load(Ordering::SeqCst);
    if pending > 0
        && app
            .failures
            .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    {
        warn!(remaining = pending - 1, "injected failure");
        return Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "Backend Error"));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    max_results: Option<usize>,
    page_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileListBody {
    items: Vec<DriveFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_page_token: Option<String>,
}

/// `GET /drive/v2/files`
pub async fn list_files(
    State(app): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<FileListBody>, ApiError> {
    admit(&app, &headers)?;
    let drive = app.drive.lock();
    let (items, next_page_token) =
        drive.list(params.max_results.unwrap_or(DEFAULT_PAGE_SIZE), params.page_token.as_deref());
    debug!(count = items.len(), ?next_page_token, "listed files");
    Ok(Json(FileListBody { items, next_page_token }))
}

/// `GET /drive/v2/files/:id`; `root` names the root folder.
pub async fn get_file(
    State(app): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<DriveFile>, ApiError> {
    admit(&app, &headers)?;
    let drive = app.drive.lock();
    drive.get(&id).cloned().map(Json).ok_or_else(|| StoreError::NotFound.into())
}

#[derive(Debug, Deserialize)]
pub struct ParentBody {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertBody {
    title: String,
    mime_type: Option<String>,
    #[serde(default)]
    parents: Vec<ParentBody>,
}

/// `POST /drive/v2/files`. Only folders can be created without media.
pub async fn insert_file(
    State(app): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<InsertBody>,
) -> Result<Json<DriveFile>, ApiError> {
    admit(&app, &headers)?;
    if body.mime_type.as_deref() != Some(crate::state::FOLDER_MIME) {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Only folders can be inserted without media"));
    }
    let parent = body.parents.first().map(|p| p.id.as_str()).unwrap_or("root");
    let folder = app.drive.lock().insert_folder(parent, &body.title)?;
    info!(id = %folder.id, title = %folder.title, "folder created");
    Ok(Json(folder))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchParams {
    add_parents: Option<String>,
    remove_parents: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PatchBody {
    title: Option<String>,
}

/// `PATCH /drive/v2/files/:id?addParents&removeParents`
pub async fn patch_file(
    State(app): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(params): Query<PatchParams>,
    Json(body): Json<PatchBody>,
) -> Result<Json<DriveFile>, ApiError> {
    admit(&app, &headers)?;
    let file = app.drive.lock().patch(
        &id,
        body.title,
        params.add_parents.as_deref(),
        params.remove_parents.as_deref(),
    )?;
    info!(%id, title = %file.title, "file patched");
    Ok(Json(file))
}

/// `POST /drive/v2/files/:id/trash`
pub async fn trash_file(
    State(app): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<DriveFile>, ApiError> {
    admit(&app, &headers)?;
    let mut drive = app.drive.lock();
    drive.trash(&id)?;
    info!(%id, "file trashed");
    drive.get(&id).cloned().map(Json).ok_or_else(|| StoreError::NotFound.into())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeParams {
    max_results: Option<usize>,
    page_token: Option<String>,
    start_change_id: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeListBody {
    largest_change_id: String,
    items: Vec<ChangeEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_page_token: Option<String>,
}

/// `GET /drive/v2/changes`
pub async fn list_changes(
    State(app): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<ChangeParams>,
) -> Result<Json<ChangeListBody>, ApiError> {
    admit(&app, &headers)?;
    let drive = app.drive.lock();
    let (items, next_page_token) = drive.changes(
        params.start_change_id.unwrap_or(1),
        params.max_results.unwrap_or(DEFAULT_PAGE_SIZE),
        params.page_token.as_deref(),
    );
    Ok(Json(ChangeListBody {
        largest_change_id: drive.largest_change_id().to_string(),
        items,
        next_page_token,
    }))
}

/// Parses `bytes=start-end`; an open end runs to the last byte.
fn parse_range(value: &str, len: u64) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => len.checked_sub(1)?,
        end => end.parse::<u64>().ok()?.min(len.checked_sub(1)?),
    };
    (start <= end).then_some((start, end))
}

#[derive(Debug, Deserialize)]
pub struct DownloadParams {
    sig: Option<u64>,
}

/// `GET /download/:id`, honouring a single `Range` header. A URL signed for
/// an older epoch is refused with an empty 403, the way an expired signed URL
/// is.
pub async fn download(
    State(app): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(params): Query<DownloadParams>,
) -> Result<Response, ApiError> {
    admit(&app, &headers)?;
    let drive = app.drive.lock();
    if params.sig.unwrap_or(0) != drive.url_epoch() {
        debug!(%id, sig = ?params.sig, "expired download url");
        return Ok(StatusCode::FORBIDDEN.into_response());
    }
    let content = drive.content(&id).ok_or(StoreError::NotFound)?;
    let len = content.len() as u64;
    app.downloads.fetch_add(1, Ordering::SeqCst);

    let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) else {
        return Ok((StatusCode::OK, content.to_vec()).into_response());
    };
    let Some((start, end)) = parse_range(range, len) else {
        return Err(ApiError::new(StatusCode::RANGE_NOT_SATISFIABLE, format!("unsatisfiable range {range}")));
    };
    debug!(%id, start, end, "serving range");
    let body = content[start as usize..=end as usize].to_vec();
    Ok((
        StatusCode::PARTIAL_CONTENT,
        [(header::CONTENT_RANGE, format!("bytes {start}-{end}/{len}"))],
        body,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadParams {
    upload_type: Option<String>,
}

/// `POST /upload/drive/v2/files?uploadType=resumable`
pub async fn create_session(
    State(app): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<UploadParams>,
    Json(body): Json<InsertBody>,
) -> Result<Response, ApiError> {
    admit(&app, &headers)?;
    if params.upload_type.as_deref() != Some("resumable") {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "only resumable uploads are supported"));
    }
    let size = headers
        .get("X-Upload-Content-Length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "missing X-Upload-Content-Length"))?;
    let mime_type = headers
        .get("X-Upload-Content-Type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(body.mime_type)
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let parent = body.parents.first().map(|p| p.id.as_str()).unwrap_or("root");

    let mut drive = app.drive.lock();
    let session_id = drive.create_session(parent, &body.title, &mime_type, size)?;
    let location = format!("{}/upload/session/{}", drive.base_url(), session_id);
    info!(%session_id, title = %body.title, size, "upload session opened");
    Ok((StatusCode::OK, [(header::LOCATION, location)]).into_response())
}

enum ContentRange {
    Query,
    Bytes { start: u64 },
}

/// Parses `bytes */size` and `bytes start-end/size`.
fn parse_content_range(value: &str) -> Option<ContentRange> {
    let (span, _size) = value.strip_prefix("bytes ")?.split_once('/')?;
    if span == "*" {
        return Some(ContentRange::Query);
    }
    let (start, _end) = span.split_once('-')?;
    Some(ContentRange::Bytes { start: start.parse().ok()? })
}

/// `PUT /upload/session/:id`: either a status query or a body of bytes.
pub async fn put_session(
    State(app): State<SharedState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    admit(&app, &headers)?;
    let range = headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range)
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "missing or malformed Content-Range"))?;

    let _open = match range {
        ContentRange::Bytes { .. } => {
            app.parked_uploads.fetch_add(1, Ordering::SeqCst);
            let open = app.upload_gate.read().await;
            app.parked_uploads.fetch_sub(1, Ordering::SeqCst);
            Some(open)
        }
        ContentRange::Query => None,
    };
    let mut drive = app.drive.lock();
    let state = match range {
        ContentRange::Query => drive.query_session(&session_id)?,
        ContentRange::Bytes { start } => {
            debug!(%session_id, start, len = body.len(), "session bytes");
            drive.put_session(&session_id, start, &body)?
        }
    };
    Ok(match state {
        SessionState::Complete(file) => {
            info!(%session_id, id = %file.id, "upload complete");
            (StatusCode::OK, Json(file)).into_response()
        }
        SessionState::Partial(last) => {
            let mut response = StatusCode::PERMANENT_REDIRECT.into_response();
            if let Some(last) = last {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes=0-{last}")) {
                    response.headers_mut().insert(header::RANGE, value);
                }
            }
            response
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_clamp_to_the_content() {
        assert_eq!(parse_range("bytes=0-9", 100), Some((0, 9)));
        assert_eq!(parse_range("bytes=90-200", 100), Some((90, 99)));
        assert_eq!(parse_range("bytes=10-", 100), Some((10, 99)));
        assert_eq!(parse_range("bytes=100-120", 100), None);
        assert_eq!(parse_range("bytes=0-0", 0), None);
        assert_eq!(parse_range("items=0-1", 100), None);
    }

    #[test]
    fn content_range_forms() {
        assert!(matches!(parse_content_range("bytes */42"), Some(ContentRange::Query)));
        assert!(matches!(parse_content_range("bytes 10-41/42"), Some(ContentRange::Bytes { start: 10 })));
        assert!(parse_content_range("10-41/42").is_none());
    }
}
