//! The main entry point for the FUSE client.
//!
//! This binary is responsible for:
//! 1. Parsing the command line and loading `config.toml`.
//! 2. Restoring the inode tree from its snapshot, or listing the remote tree.
//! 3. Resuming interrupted uploads and starting the change poller.
//! 4. Mounting the filesystem at the given mountpoint.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use daemonize::Daemonize;
use fuser::MountOption;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use drivefs::api_client::{DriveClient, RemoteStore};
use drivefs::auth::{FileTokenProvider, StaticToken, TokenProvider};
use drivefs::cache::{CacheSettings, ChunkCache, SegmentIndex};
use drivefs::config::{Config, load_config};
use drivefs::fs::{FsWrapper, RemoteFS};
use drivefs::metadata::{MetadataIndex, SNAPSHOT_FILE};
use drivefs::retry::RetryPolicy;
use drivefs::sync::{CURSOR_FILE, ChangeSync, ScanStore, full_scan, load_cursor, save_cursor};
use drivefs::upload::{LEDGER_FILE, UploadEngine, UploadLedger, UploadSettings};

/// SQLite file holding the segment index and the raw scan rows.
const CACHE_DB: &str = "cache.db";

#[derive(Parser, Debug)]
#[command(name = "drivefs", version, about = "Mounts a remote Drive-style object store")]
struct Args {
    /// Directory to mount the remote tree on.
    mountpoint: PathBuf,
    /// Path of the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
    /// Log file, written in addition to stderr.
    #[arg(long, default_value = "/tmp/drivefs.log")]
    log_file: PathBuf,
    /// Stay attached to the terminal instead of daemonizing.
    #[arg(short, long)]
    foreground: bool,
    /// Use this bearer token instead of the token file (local emulator).
    #[arg(long)]
    static_token: Option<String>,
    /// Overrides `api_url` from the configuration.
    #[arg(long)]
    api_url: Option<String>,
    /// Overrides `upload_url` from the configuration.
    #[arg(long)]
    upload_url: Option<String>,
}

// FUSE callbacks block on the runtime from the mount thread, so `main` must
// not itself run inside the runtime.
fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Fork before any thread exists.
    if !args.foreground {
        let cwd = std::env::current_dir().context("cannot read working directory")?;
        Daemonize::new().working_directory(cwd).start().context("cannot daemonize")?;
    }
    let _log_guard = init_logging(&args.log_file);

    let mut config = load_config(&args.config);
    if let Some(url) = args.api_url {
        config.api_url = url;
    }
    if let Some(url) = args.upload_url {
        config.upload_url = url;
    }
    info!(?config, "configuration loaded");
    config.validate().map_err(anyhow::Error::msg).context("invalid configuration")?;
    config.ensure_dirs().context("cannot create cache directories")?;

    let tokens: Arc<dyn TokenProvider> = match args.static_token {
        Some(token) => Arc::new(StaticToken(token)),
        None => Arc::new(FileTokenProvider::new(config.token_file.clone())),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("cannot start the async runtime")?;
    let fs = runtime.block_on(bootstrap(&config, tokens))?;

    let options = vec![MountOption::AutoUnmount, MountOption::FSName("drivefs".to_string())];
    info!(mountpoint = %args.mountpoint.display(), "mounting");
    fuser::mount2(FsWrapper::new(fs, runtime.handle().clone()), &args.mountpoint, &options)
        .with_context(|| format!("cannot mount {}", args.mountpoint.display()))?;
    info!("unmounted");
    Ok(())
}

/// Logs to stderr and to `log_file`; `RUST_LOG` overrides the `drivefs=info` default.
fn init_logging(log_file: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "drivefs=info".into());
    let registry = tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer());

    let dir = log_file.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
    match log_file.file_name() {
        Some(name) => {
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            registry.with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer)).init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

/// Builds every component in dependency order and starts the background tasks.
async fn bootstrap(config: &Config, tokens: Arc<dyn TokenProvider>) -> anyhow::Result<Arc<RemoteFS>> {
    let remote: Arc<dyn RemoteStore> = Arc::new(DriveClient::new(&config.api_url, &config.upload_url, tokens));
    let data = config.data_dir();
    let db_path = data.join(CACHE_DB);
    let snapshot_path = data.join(SNAPSHOT_FILE);
    let cursor_path = data.join(CURSOR_FILE);

    let snapshot = MetadataIndex::load_snapshot(&snapshot_path).await;
    let cursor = load_cursor(&cursor_path).await;
    let (tree, largest_change_id, deferred) = match (snapshot, cursor) {
        (Ok(tree), Ok(Some(largest))) => {
            info!(nodes = tree.len(), largest_change_id = largest, "restored inode tree");
            (tree, largest, Vec::new())
        }
        (snapshot, cursor) => {
            if let Err(e) = snapshot {
                warn!(error = %e, "no usable snapshot, listing the remote tree");
            } else {
                warn!(cursor = ?cursor.ok(), "no usable change cursor, listing the remote tree");
            }
            let store = ScanStore::open(&db_path)?;
            let scan = full_scan(remote.as_ref(), &store, &RetryPolicy::background())
                .await
                .context("full scan failed")?;
            save_cursor(&cursor_path, scan.largest_change_id).await?;
            (scan.tree, scan.largest_change_id, scan.deferred)
        }
    };

    let index = MetadataIndex::persistent(tree, snapshot_path);
    index.save_now().await?;

    let segments = Arc::new(SegmentIndex::open(&db_path, &config.download_dir(), config.max_cache_bytes())?);
    let cache = ChunkCache::open(remote.clone(), CacheSettings::from(config), config.download_dir(), segments)?;

    let ledger = UploadLedger::open(data.join(LEDGER_FILE)).await?;
    let uploads = UploadEngine::new(
        remote.clone(),
        index.clone(),
        cache.clone(),
        ledger,
        config.upload_dir(),
        UploadSettings::from(config),
    );
    let resumed = uploads.resume().await?;
    info!(?resumed, "upload queue restored");

    let sync = ChangeSync::new(remote.clone(), index.clone(), largest_change_id, config.refresh_delay())
        .with_cache(cache.clone())
        .with_cursor_file(cursor_path);
    sync.defer(deferred);
    tokio::spawn(Arc::new(sync).run());

    let ttl = Duration::from_secs(config.kernel_attr_timeout_seconds);
    Ok(Arc::new(RemoteFS::new(index, cache, uploads, remote, ttl)))
}
