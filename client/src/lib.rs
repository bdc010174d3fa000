//! drivefs: a remote, quota-limited object store mounted as a filesystem.
//!
//! The crate is layered leaves first:
//! - [`metadata`]: the inode tree, source of truth for every visible entry.
//! - [`cache`]: chunked downloads with read-ahead and a bounded disk budget.
//! - [`upload`]: resumable uploads of files written through the mount.
//! - [`sync`]: the cold-start scan and the change-feed poller.
//! - [`fs`]: the FUSE adapter on top of all of them.

pub mod api_client;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod metadata;
pub mod persist;
pub mod retry;
pub mod sync;
pub mod upload;
