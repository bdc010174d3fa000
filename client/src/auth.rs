//! Bearer credential supply.
//!
//! The interactive consent flow is out of scope: an external helper keeps a
//! token file current and the mount re-reads it whenever the remote rejects
//! the token it holds.

use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::DriveError;

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, DriveError>;
    /// Obtains a fresh token. Concurrent callers share one refresh.
    async fn refresh(&self) -> Result<String, DriveError>;
}

/// A fixed token, for the local emulator and tests.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String, DriveError> {
        Ok(self.0.clone())
    }

    async fn refresh(&self) -> Result<String, DriveError> {
        Ok(self.0.clone())
    }
}

#[derive(Deserialize)]
struct TokenFile {
    access_token: String,
}

/// Reads `{"access_token": "..."}` from a file.
pub struct FileTokenProvider {
    path: PathBuf,
    current: RwLock<Option<String>>,
    /// Serialises refreshes; the generation tells latecomers a refresh already happened.
    refresh_lock: tokio::sync::Mutex<u64>,
    generation: RwLock<u64>,
}

impl FileTokenProvider {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            current: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(0),
            generation: RwLock::new(0),
        }
    }

    async fn read_file(&self) -> Result<String, DriveError> {
        let bytes = tokio::fs::read(&self.path).await?;
        let token: TokenFile = serde_json::from_slice(&bytes)?;
        Ok(token.access_token)
    }
}

#[async_trait]
impl TokenProvider for FileTokenProvider {
    async fn access_token(&self) -> Result<String, DriveError> {
        let cached = self.current.read().clone();
        match cached {
            Some(token) => Ok(token),
            None => self.refresh().await,
        }
    }

    async fn refresh(&self) -> Result<String, DriveError> {
        let seen = *self.generation.read();
        let mut done = self.refresh_lock.lock().await;
        if *done > seen {
            let cached = self.current.read().clone();
            if let Some(token) = cached {
                return Ok(token);
            }
        }

        let token = match self.read_file().await {
            Ok(token) => token,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot read token file");
                return Err(DriveError::CredentialInvalid);
            }
        };
        let changed = self.current.read().as_deref() != Some(token.as_str());
        if changed {
            info!("access token refreshed");
        }
        *self.current.write() = Some(token.clone());
        *done += 1;
        *self.generation.write() = *done;
        Ok(token)
    }
}
