//! Error types shared by the remote client, the caching layers and the
//! filesystem adapter.
//!
//! `DriveError` describes what went wrong talking to the remote store or the
//! local cache. `FsError` is what the adapter hands back to the kernel and
//! knows its own errno.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("remote returned {status}: {body}")]
    Server { status: u16, body: String },

    /// A signed download URL is no longer accepted; the object must be re-resolved.
    #[error("download url expired")]
    CredentialExpired,

    /// The access token was rejected; credentials must be refreshed.
    #[error("credentials rejected")]
    CredentialInvalid,

    #[error("remote object not found: {0}")]
    NotFound(String),

    /// The upload session refused bytes starting at `offset`; its committed
    /// offset must be queried before resuming.
    #[error("upload session refused the range starting at {offset}")]
    RangeMismatch { offset: u64 },

    #[error("integrity check failed for {0}")]
    Integrity(String),

    #[error("remote rejected the content type {0}")]
    InvalidContentType(String),

    #[error("request rejected with {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("read of {len} bytes at {offset} spans more than two chunks")]
    ReadTooLarge { offset: u64, len: u64 },

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("segment index error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A failure observed by another task and handed over through a broadcast.
    #[error("{0}")]
    Shared(String),
}

impl DriveError {
    /// Errors worth retrying after a delay without changing anything.
    pub fn is_transient(&self) -> bool {
        match self {
            DriveError::Network(_) => true,
            DriveError::Server { .. } => true,
            DriveError::RangeMismatch { .. } => true,
            DriveError::Integrity(_) => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DriveError::NotFound(_))
    }

    /// A copy for another waiter. Variants that carry no foreign error are
    /// reproduced exactly; the rest become `Shared` with the same message.
    pub fn duplicate(&self) -> DriveError {
        match self {
            DriveError::CredentialExpired => DriveError::CredentialExpired,
            DriveError::CredentialInvalid => DriveError::CredentialInvalid,
            DriveError::NotFound(id) => DriveError::NotFound(id.clone()),
            DriveError::Integrity(what) => DriveError::Integrity(what.clone()),
            DriveError::ReadTooLarge { offset, len } => {
                DriveError::ReadTooLarge { offset: *offset, len: *len }
            }
            other => DriveError::Shared(other.to_string()),
        }
    }
}

/// Failure of a filesystem operation, carried back to the kernel as an errno.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such entry")]
    NotFound,
    #[error("entry already exists")]
    Exists,
    #[error("not a directory")]
    NotDir,
    #[error("is a directory")]
    IsDir,
    #[error("directory not empty")]
    NotEmpty,
    #[error("permission denied")]
    Access,
    #[error("bad file handle")]
    BadHandle,
    #[error("invalid argument")]
    Invalid,
    #[error(transparent)]
    Drive(#[from] DriveError),
}

impl FsError {
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::Exists => libc::EEXIST,
            FsError::NotDir => libc::ENOTDIR,
            FsError::IsDir => libc::EISDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::Access => libc::EACCES,
            FsError::BadHandle => libc::EBADF,
            FsError::Invalid => libc::EINVAL,
            FsError::Drive(DriveError::NotFound(_)) => libc::ENOENT,
            FsError::Drive(DriveError::ReadTooLarge { .. }) => libc::EINVAL,
            FsError::Drive(DriveError::CredentialInvalid) => libc::EACCES,
            FsError::Drive(DriveError::Io(e)) => e.raw_os_error().unwrap_or(libc::EIO),
            FsError::Drive(_) => libc::EIO,
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        FsError::Drive(DriveError::Io(e))
    }
}
