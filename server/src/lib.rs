//! A local emulator of the subset of the Drive v2 API that drivefs uses.
//!
//! State lives in memory; [`app`] builds the router so tests can serve it
//! on an ephemeral port.

pub mod handlers;
pub mod state;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize};

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};
use parking_lot::{Mutex, RwLock};
use tower_http::trace::TraceLayer;

pub use state::{DriveFile, DriveState, ROOT_ID};

use handlers::*;

pub struct AppState {
    pub drive: Mutex<DriveState>,
    /// Bearer token every request must present; `None` admits everyone.
    pub token: RwLock<Option<String>>,
    /// Byte-carrying session `PUT`s wait for a read guard; holding the write
    /// guard keeps uploads in flight.
    pub upload_gate: tokio::sync::RwLock<()>,
    /// Session `PUT`s whose body has arrived and that wait at the gate.
    pub parked_uploads: AtomicUsize,
    /// Number of upcoming requests answered with 503.
    pub failures: AtomicU32,
    /// Download requests served, ranged or not.
    pub downloads: AtomicU64,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(base_url: &str, token: Option<String>) -> SharedState {
        Arc::new(Self {
            drive: Mutex::new(DriveState::new(base_url)),
            token: RwLock::new(token),
            upload_gate: tokio::sync::RwLock::new(()),
            parked_uploads: AtomicUsize::new(0),
            failures: AtomicU32::new(0),
            downloads: AtomicU64::new(0),
        })
    }

    /// Replaces the accepted bearer token; holders of the old one get 401.
    pub fn rotate_token(&self, token: &str) {
        *self.token.write() = Some(token.to_string());
    }

    /// Makes the next `count` requests fail with a transient error.
    pub fn inject_failures(&self, count: u32) {
        self.failures.store(count, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Builds the router serving the metadata, change, download and upload endpoints.
pub fn app(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/drive/v2/files", get(list_files).post(insert_file))
        .route("/drive/v2/files/:id", get(get_file).patch(patch_file))
        .route("/drive/v2/files/:id/trash", post(trash_file))
        .route("/drive/v2/changes", get(list_changes))
        .route("/download/:id", get(download))
        .route("/upload/drive/v2/files", post(create_session))
        .route("/upload/session/:id", put(put_session).layer(DefaultBodyLimit::disable()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves a fresh emulator on an ephemeral loopback port.
///
/// Returns the base URL and the shared state, so callers can seed objects
/// or inject failures directly.
pub async fn spawn(token: Option<String>) -> std::io::Result<(String, SharedState)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let base = format!("http://{}", listener.local_addr()?);
    let state = AppState::new(&base, token);
    let router = app(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "emulator stopped");
        }
    });
    Ok((base, state))
}
