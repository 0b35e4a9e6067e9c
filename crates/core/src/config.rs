//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// HTTP server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

/// Local artifact cache.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalStoreConfig {
    /// Root directory; artifacts live at `{path}/{device}/{version}/{filename}`.
    #[serde(default = "default_local_path")]
    pub path: PathBuf,
}

fn default_local_path() -> PathBuf {
    PathBuf::from("./data/builds")
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            path: default_local_path(),
        }
    }
}

/// Storage backend configuration for promoted artifacts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// Falls back to the default AWS credential chain if not set.
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        /// Force path-style URLs. Required for MinIO and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/remote"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.is_empty() {
                    return Err("s3 config requires a bucket".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            _ => Ok(()),
        }
    }

    /// Name substituted for `{bucket}` in download URL templates.
    pub fn bucket_name(&self) -> String {
        match self {
            StorageConfig::S3 { bucket, .. } => bucket.clone(),
            StorageConfig::Filesystem { path } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (small deployments and tests).
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Advisory query timeout in seconds; slow queries are logged, not cancelled.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL. Takes precedence over individual fields.
        url: Option<String>,
        host: Option<String>,
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        username: Option<String>,
        /// Prefer MIRROR_METADATA__PASSWORD over storing this in a file.
        password: Option<String>,
        database: Option<String>,
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(60_000)
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(60)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/mirror.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                max_connections,
                ..
            } => {
                if *max_connections == 0 {
                    return Err("postgres max_connections must be at least 1".to_string());
                }
                match (url.as_ref(), host.as_ref(), database.as_ref()) {
                    (Some(_), _, _) => Ok(()),
                    (None, Some(_), Some(_)) => Ok(()),
                    (None, None, _) => Err(
                        "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                    ),
                    (None, Some(_), None) => Err(
                        "postgres config requires 'database' when using individual fields"
                            .to_string(),
                    ),
                }
            }
        }
    }
}

/// Source of the public key that upstream signatures are checked against.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TrustedKeyConfig {
    /// Key stored in a file, `name:base64`.
    File { path: PathBuf },
    /// Key provided directly as a value.
    Value { key: String },
}

/// Upstream updater and device roster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the updater API.
    #[serde(default = "default_updater_url")]
    pub updater_url: String,
    /// Plain-text roster of device codenames. Ignored when `device` is set.
    #[serde(default = "default_device_list_url")]
    pub device_list_url: Option<String>,
    /// Mirror a single device instead of the roster.
    #[serde(default)]
    pub device: Option<String>,
    /// Release channel, e.g. "nightly".
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Required for ingest; artifacts are never stored unverified.
    #[serde(default)]
    pub trusted_key: Option<TrustedKeyConfig>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Download attempts per artifact on size or hash mismatch.
    #[serde(default = "default_download_attempts")]
    pub download_attempts: u32,
    /// Devices fetched and verified concurrently within one sweep.
    #[serde(default = "default_max_concurrent_devices")]
    pub max_concurrent_devices: usize,
}

fn default_updater_url() -> String {
    "https://download.lineageos.org".to_string()
}

fn default_device_list_url() -> Option<String> {
    Some(
        "https://raw.githubusercontent.com/LineageOS/hudson/master/lineage-build-targets"
            .to_string(),
    )
}

fn default_channel() -> String {
    "nightly".to_string()
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_download_attempts() -> u32 {
    2
}

fn default_max_concurrent_devices() -> usize {
    4
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            updater_url: default_updater_url(),
            device_list_url: default_device_list_url(),
            device: None,
            channel: default_channel(),
            trusted_key: None,
            request_timeout_secs: default_request_timeout_secs(),
            download_attempts: default_download_attempts(),
            max_concurrent_devices: default_max_concurrent_devices(),
        }
    }
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.device.is_none() && self.device_list_url.is_none() {
            return Err("upstream requires either 'device' or 'device_list_url'".to_string());
        }
        if self.channel.is_empty() || self.channel.contains('/') {
            return Err(format!("upstream channel {:?} is invalid", self.channel));
        }
        if self.download_attempts == 0 {
            return Err("upstream.download_attempts must be at least 1".to_string());
        }
        if self.max_concurrent_devices == 0 {
            return Err("upstream.max_concurrent_devices must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Local retention cap.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Builds kept locally per (device, version). Unset keeps everything.
    #[serde(default)]
    pub retain: Option<u32>,
    /// Report what would be pruned without deleting anything.
    #[serde(default)]
    pub dry_run: bool,
}

/// Periodic ingest + prune in the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Promotion of local artifacts to remote storage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Concurrent upload workers.
    #[serde(default = "default_upload_workers")]
    pub workers: usize,
    /// Transfer attempts per job before it fails.
    #[serde(default = "default_upload_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts; doubles each retry.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// How long a failed job stays visible to pollers.
    #[serde(default = "default_failed_visibility_secs")]
    pub failed_visibility_secs: u64,
    /// Public URL template with `{bucket}` and `{file}` placeholders.
    #[serde(default = "default_download_url")]
    pub download_url: String,
}

fn default_upload_workers() -> usize {
    1
}

fn default_upload_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_failed_visibility_secs() -> u64 {
    10
}

fn default_download_url() -> String {
    "https://{bucket}.s3.amazonaws.com/{file}".to_string()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            workers: default_upload_workers(),
            max_attempts: default_upload_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            failed_visibility_secs: default_failed_visibility_secs(),
            download_url: default_download_url(),
        }
    }
}

impl UploadConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn failed_visibility(&self) -> Duration {
        Duration::from_secs(self.failed_visibility_secs)
    }

    /// Public URL of a promoted artifact.
    pub fn download_url_for(&self, bucket: &str, file: &str) -> String {
        self.download_url
            .replace("{bucket}", bucket)
            .replace("{file}", file)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("upload.workers must be at least 1".to_string());
        }
        if self.max_attempts == 0 {
            return Err("upload.max_attempts must be at least 1".to_string());
        }
        if !self.download_url.contains("{file}") {
            return Err("upload.download_url must contain a {file} placeholder".to_string());
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Local artifact cache.
    #[serde(default)]
    pub local: LocalStoreConfig,
    /// Remote storage that uploads are promoted to.
    #[serde(default)]
    pub remote: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub upload: UploadConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses filesystem storage, SQLite metadata and
    /// a single upstream device so no roster fetch is needed.
    pub fn for_testing() -> Self {
        Self {
            upstream: UpstreamConfig {
                device: Some("oneplus3".to_string()),
                device_list_url: None,
                ..UpstreamConfig::default()
            },
            upload: UploadConfig {
                retry_backoff_ms: 10,
                failed_visibility_secs: 1,
                download_url: "https://downloads.example/{bucket}/{file}".to_string(),
                ..UploadConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.remote.validate()?;
        self.metadata.validate()?;
        self.upstream.validate()?;
        self.upload.validate()?;
        if self.sweep.enabled && self.sweep.interval_secs == 0 {
            return Err("sweep.interval_secs must be positive when sweep is enabled".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_s3_rejects_partial_credentials() {
        let config = StorageConfig::S3 {
            bucket: "builds".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("key".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_config_tagged_deserialize() {
        let json = r#"{"type": "s3", "bucket": "mirror-builds", "region": "eu-west-1"}"#;
        let config: StorageConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.bucket_name(), "mirror-builds");
        config.validate().unwrap();
    }

    #[test]
    fn test_metadata_postgres_requires_database() {
        let json = r#"{"type": "postgres", "host": "db"}"#;
        let config: MetadataConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());

        let json = r#"{"type": "postgres", "url": "postgres://u@db/mirror"}"#;
        let config: MetadataConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_upstream_defaults() {
        let config: UpstreamConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.channel, "nightly");
        assert_eq!(config.updater_url, "https://download.lineageos.org");
        assert!(config.device_list_url.is_some());
        config.validate().unwrap();
    }

    #[test]
    fn test_upstream_requires_roster_or_device() {
        let config = UpstreamConfig {
            device_list_url: None,
            ..UpstreamConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_download_url_template() {
        let config = UploadConfig::default();
        assert_eq!(
            config.download_url_for("mirror", "a.zip"),
            "https://mirror.s3.amazonaws.com/a.zip"
        );

        let bad = UploadConfig {
            download_url: "https://example/{bucket}".to_string(),
            ..UploadConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_app_config_empty_document_uses_defaults() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert!(config.retention.retain.is_none());
        assert!(!config.sweep.enabled);
        assert_eq!(config.upload.workers, 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_for_testing_is_valid() {
        AppConfig::for_testing().validate().unwrap();
    }
}
