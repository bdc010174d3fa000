use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const MIB: u64 = 1024 * 1024;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// Root of the local cache. `upload/`, `download/` and `data/` live below it.
    pub cache_location: PathBuf,
    /// Size of one download chunk in bytes.
    pub chunk_size: u64,
    /// Number of chunks fetched ahead of a sequential reader.
    pub advanced_chunks: u64,
    /// Upper bound of the download cache in MiB.
    pub max_cache_size_mb: u64,
    /// Base interval between change polls in milliseconds.
    pub refresh_delay_ms: u64,
    pub max_concurrent_uploads: usize,
    /// Idle time after which a pooled segment descriptor is closed.
    pub fd_idle_timeout_secs: u64,
    /// Seconds a released file must keep the same size before it is
    /// uploaded; a file that grew or shrank meanwhile is queued again.
    pub upload_settle_delay_secs: u64,
    /// Base URL of the metadata API.
    pub api_url: String,
    /// Base URL of the resumable upload API.
    pub upload_url: String,
    /// JSON file holding `{"access_token": "..."}`; re-read on refresh.
    pub token_file: PathBuf,
    pub kernel_attr_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_location: PathBuf::from("/tmp/cache"),
            chunk_size: 16 * MIB,
            advanced_chunks: 5,
            max_cache_size_mb: 10 * 1024,
            refresh_delay_ms: 5000,
            max_concurrent_uploads: 4,
            fd_idle_timeout_secs: 6,
            upload_settle_delay_secs: 5,
            api_url: "https://www.googleapis.com/drive/v2".to_string(),
            upload_url: "https://www.googleapis.com/upload/drive/v2".to_string(),
            token_file: PathBuf::from("token.json"),
            kernel_attr_timeout_seconds: 1,
        }
    }
}

impl Config {
    pub fn upload_dir(&self) -> PathBuf {
        self.cache_location.join("upload")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.cache_location.join("download")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.cache_location.join("data")
    }

    pub fn max_cache_bytes(&self) -> u64 {
        self.max_cache_size_mb * MIB
    }

    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_delay_ms)
    }

    pub fn fd_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.fd_idle_timeout_secs)
    }

    pub fn upload_settle_delay(&self) -> Duration {
        Duration::from_secs(self.upload_settle_delay_secs)
    }

    /// Checks that the chunk size is usable and that both service URLs parse
    /// as absolute http(s) URLs.
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk_size must be greater than zero".to_string());
        }
        for (key, value) in [("api_url", &self.api_url), ("upload_url", &self.upload_url)] {
            let url = Url::parse(value).map_err(|e| format!("{key} = {value:?}: {e}"))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(format!("{key} = {value:?}: unsupported scheme {}", url.scheme()));
            }
        }
        Ok(())
    }

    /// Creates the cache directory layout if it does not exist yet.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [self.upload_dir(), self.download_dir(), self.data_dir()] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Reads `path` as TOML. A missing or malformed file falls back to defaults.
pub fn load_config(path: &Path) -> Config {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return Config::default();
    }

    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "cannot read config, using defaults");
            return Config::default();
        }
    };

    match toml::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "cannot parse config, using defaults");
            Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let cfg = load_config(Path::new("/definitely/not/here/config.toml"));
        assert_eq!(cfg.chunk_size, 16 * MIB);
        assert_eq!(cfg.advanced_chunks, 5);
        assert_eq!(cfg.max_cache_bytes(), 10 * 1024 * MIB);
        assert_eq!(cfg.refresh_delay(), Duration::from_millis(5000));
        assert_eq!(cfg.max_concurrent_uploads, 4);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "cache_location = \"/var/cache/drivefs\"\nchunk_size = 1048576\n").unwrap();

        let cfg = load_config(&path);
        assert_eq!(cfg.cache_location, PathBuf::from("/var/cache/drivefs"));
        assert_eq!(cfg.chunk_size, MIB);
        assert_eq!(cfg.advanced_chunks, 5);
        assert_eq!(cfg.download_dir(), PathBuf::from("/var/cache/drivefs/download"));
    }

    #[test]
    fn service_urls_must_be_http() {
        let mut cfg = Config::default();
        assert!(cfg.validate().is_ok());
        cfg.api_url = "http://127.0.0.1:8080/drive/v2".to_string();
        assert!(cfg.validate().is_ok());
        cfg.upload_url = "ftp://example.com/upload".to_string();
        assert!(cfg.validate().unwrap_err().contains("upload_url"));
        cfg.upload_url = "not a url".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_chunk_size_is_refused() {
        let cfg = Config { chunk_size: 0, ..Config::default() };
        assert!(cfg.validate().unwrap_err().contains("chunk_size"));
    }

    #[test]
    fn malformed_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "chunk_size = \"lots\"").unwrap();
        assert_eq!(load_config(&path).chunk_size, 16 * MIB);
    }
}
