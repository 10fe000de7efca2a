//! Configuration types shared across crates.

use crate::asset::LocationTier;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Upload session time-to-live in seconds.
    #[serde(default = "default_upload_ttl_secs")]
    pub upload_ttl_secs: u64,
    /// Maximum chunk size in bytes.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Maximum number of chunks a session may declare.
    #[serde(default = "default_max_chunk_count")]
    pub max_chunk_count: u32,
    /// Interval between background expiry sweeps. Zero disables the background task.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Sessions handled per sweep batch.
    #[serde(default = "default_sweep_batch_size")]
    pub sweep_batch_size: u32,
    /// A finish that has not progressed for this long is considered abandoned
    /// and its session is reopened by the sweep.
    #[serde(default = "default_finish_stale_secs")]
    pub finish_stale_secs: u64,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_upload_ttl_secs() -> u64 {
    86400 // 24 hours
}

fn default_max_chunk_size() -> u64 {
    crate::MAX_CHUNK_SIZE
}

fn default_max_chunk_count() -> u32 {
    crate::MAX_CHUNK_COUNT
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_sweep_batch_size() -> u32 {
    256
}

fn default_finish_stale_secs() -> u64 {
    900
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            upload_ttl_secs: default_upload_ttl_secs(),
            max_chunk_size: default_max_chunk_size(),
            max_chunk_count: default_max_chunk_count(),
            sweep_interval_secs: default_sweep_interval_secs(),
            sweep_batch_size: default_sweep_batch_size(),
            finish_stale_secs: default_finish_stale_secs(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl ServerConfig {
    /// Get the upload session TTL as a Duration.
    pub fn upload_ttl(&self) -> Duration {
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        let secs = i64::try_from(self.upload_ttl_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }

    pub fn finish_stale_after(&self) -> Duration {
        let secs = i64::try_from(self.finish_stale_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.upload_ttl_secs == 0 {
            return Err("server.upload_ttl_secs must be greater than 0".to_string());
        }
        if self.max_chunk_size == 0 {
            return Err("server.max_chunk_size must be greater than 0".to_string());
        }
        if self.max_chunk_count == 0 {
            return Err("server.max_chunk_count must be greater than 0".to_string());
        }
        if self.sweep_batch_size == 0 {
            return Err("server.sweep_batch_size must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Size thresholds that decide which tier a finished asset lands in.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TieringConfig {
    /// Assets at or below this size are stored inline in their record.
    #[serde(default = "default_inline_max_bytes")]
    pub inline_max_bytes: u64,
    /// Assets at or below this size are stored in the internal arena.
    /// Larger assets go to the external blob store.
    #[serde(default = "default_internal_max_bytes")]
    pub internal_max_bytes: u64,
}

fn default_inline_max_bytes() -> u64 {
    32 * 1024
}

fn default_internal_max_bytes() -> u64 {
    64 * 1024 * 1024
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            inline_max_bytes: default_inline_max_bytes(),
            internal_max_bytes: default_internal_max_bytes(),
        }
    }
}

impl TieringConfig {
    /// Pick the tier for an asset of `size` bytes.
    ///
    /// Without an external store, oversized assets stay internal.
    pub fn select_tier(&self, size: u64, external_available: bool) -> LocationTier {
        if size <= self.inline_max_bytes {
            LocationTier::Inline
        } else if size <= self.internal_max_bytes || !external_available {
            LocationTier::Internal
        } else {
            LocationTier::External
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.inline_max_bytes > self.internal_max_bytes {
            return Err(format!(
                "tiering.inline_max_bytes ({}) must not exceed tiering.internal_max_bytes ({})",
                self.inline_max_bytes, self.internal_max_bytes
            ));
        }
        Ok(())
    }
}

/// Persistent paged memory backing the internal tier and in-flight chunks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ArenaConfig {
    /// Volatile memory. Contents are lost on restart.
    Memory,
    /// A single file holding all pages.
    File {
        /// Path of the page file.
        path: PathBuf,
    },
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self::File {
            path: PathBuf::from("./data/arena.pages"),
        }
    }
}

/// External blob store configuration.
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
        /// AWS access key ID. Falls back to the ambient credential chain if not set.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to the ambient credential chain if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs (`endpoint/bucket/key`). Required for MinIO.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl StorageConfig {
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
            StorageConfig::Filesystem { .. } => Ok(()),
        }
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    Sqlite {
        path: PathBuf,
    },
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
        }
    }
}

/// A bearer token provisioned at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Principal the token authenticates as.
    pub principal: String,
    /// SHA-256 of the token (hex, 64 characters, optional "sha256:" prefix).
    /// Generate with: `echo -n "your-secret-token" | sha256sum`
    pub token_hash: String,
}

/// Authentication configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tiering: TieringConfig,
    #[serde(default)]
    pub arena: ArenaConfig,
    /// External blob store. Without one, large assets stay in the arena.
    #[serde(default)]
    pub external: Option<StorageConfig>,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses a volatile arena and no external store.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            tiering: TieringConfig::default(),
            arena: ArenaConfig::Memory,
            external: None,
            metadata: MetadataConfig::default(),
            auth: AuthConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;
        self.tiering.validate()?;
        if let Some(external) = &self.external {
            external.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::default();
        assert!(config.metrics_enabled);
        assert_eq!(config.upload_ttl(), Duration::hours(24));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_upload_ttl_saturates() {
        let config = ServerConfig {
            upload_ttl_secs: u64::MAX,
            ..ServerConfig::default()
        };
        assert!(config.upload_ttl().is_positive());
    }

    #[test]
    fn test_select_tier_thresholds() {
        let tiering = TieringConfig {
            inline_max_bytes: 10,
            internal_max_bytes: 100,
        };
        assert_eq!(tiering.select_tier(0, true), LocationTier::Inline);
        assert_eq!(tiering.select_tier(10, true), LocationTier::Inline);
        assert_eq!(tiering.select_tier(11, true), LocationTier::Internal);
        assert_eq!(tiering.select_tier(100, true), LocationTier::Internal);
        assert_eq!(tiering.select_tier(101, true), LocationTier::External);
        assert_eq!(tiering.select_tier(101, false), LocationTier::Internal);
    }

    #[test]
    fn test_tiering_validation() {
        let bad = TieringConfig {
            inline_max_bytes: 200,
            internal_max_bytes: 100,
        };
        assert!(bad.validate().is_err());
        assert!(TieringConfig::default().validate().is_ok());
    }

    #[test]
    fn test_server_config_deserialize_partial() {
        let json = r#"{"upload_ttl_secs": 60}"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.upload_ttl_secs, 60);
        assert_eq!(config.max_chunk_size, crate::MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_arena_config_tagged() {
        let config: ArenaConfig =
            serde_json::from_str(r#"{"type":"file","path":"/var/lib/keepsake/arena"}"#).unwrap();
        assert!(matches!(config, ArenaConfig::File { .. }));
        let config: ArenaConfig = serde_json::from_str(r#"{"type":"memory"}"#).unwrap();
        assert!(matches!(config, ArenaConfig::Memory));
    }

    #[test]
    fn test_storage_config_s3_validate_partial_credentials() {
        let invalid = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access-key".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };
        assert!(invalid.validate().is_err());

        let valid = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access-key".to_string()),
            secret_access_key: Some("secret-key".to_string()),
            force_path_style: false,
        };
        assert!(valid.validate().is_ok());
    }

    #[test]
    fn test_storage_config_s3_force_path_style_defaults_to_false() {
        let json = r#"{"type":"s3","bucket":"test","endpoint":"https://s3.amazonaws.com"}"#;
        let config: StorageConfig = serde_json::from_str(json).unwrap();
        match config {
            StorageConfig::S3 {
                force_path_style, ..
            } => assert!(!force_path_style),
            _ => panic!("expected S3 config"),
        }
    }

    #[test]
    fn test_app_config_for_testing_is_valid() {
        let config = AppConfig::for_testing();
        assert!(config.validate().is_ok());
        assert!(config.external.is_none());
    }
}
