//! Virtual filesystem configuration.
//!
//! The configuration record is read once (programmatically or from a TOML
//! file), validated, and handed to the VFS at construction. It is immutable
//! afterwards.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::status::Status;

/// Minimum size of an S3 multipart upload part.
pub const S3_MIN_MULTIPART_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Errors raised while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl From<ConfigError> for Status {
    fn from(e: ConfigError) -> Status {
        Status::invalid_argument(e.to_string())
    }
}

/// Top-level VFS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    /// Worker count of the I/O thread pool. Must be at least 1.
    pub num_parallel_operations: usize,

    /// Reads of at least this many bytes are sharded across the pool.
    pub parallel_read_threshold: u64,

    pub s3: S3Config,
    pub hdfs: HdfsConfig,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            num_parallel_operations: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            parallel_read_threshold: 10 * 1024 * 1024,
            s3: S3Config::default(),
            hdfs: HdfsConfig::default(),
        }
    }
}

impl VfsConfig {
    /// Load a configuration from a TOML file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: VfsConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_parallel_operations < 1 {
            return Err(ConfigError::Invalid {
                field: "num_parallel_operations",
                reason: "must be at least 1".into(),
            });
        }
        if self.parallel_read_threshold < 1 {
            return Err(ConfigError::Invalid {
                field: "parallel_read_threshold",
                reason: "must be at least 1 byte".into(),
            });
        }
        self.s3.validate()
    }
}

/// S3 backend parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub region: String,

    /// `http` or `https`; applied to `endpoint_override` when that carries
    /// no scheme of its own.
    pub scheme: String,

    /// Custom endpoint (e.g. a MinIO address). `None` means AWS.
    pub endpoint_override: Option<String>,

    /// Virtual-hosted addressing (`bucket.host`) versus path-style.
    pub use_virtual_addressing: bool,

    /// Bytes buffered per file before a multipart part is uploaded.
    pub file_buffer_size: u64,

    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".into(),
            scheme: "https".into(),
            endpoint_override: None,
            use_virtual_addressing: true,
            file_buffer_size: S3_MIN_MULTIPART_PART_SIZE,
            connect_timeout_ms: 3000,
            request_timeout_ms: 3000,
        }
    }
}

impl S3Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.scheme != "http" && self.scheme != "https" {
            return Err(ConfigError::Invalid {
                field: "s3.scheme",
                reason: format!("must be `http` or `https`, got `{}`", self.scheme),
            });
        }
        if self.file_buffer_size < S3_MIN_MULTIPART_PART_SIZE {
            return Err(ConfigError::Invalid {
                field: "s3.file_buffer_size",
                reason: format!(
                    "must be at least the {} byte multipart minimum",
                    S3_MIN_MULTIPART_PART_SIZE
                ),
            });
        }
        Ok(())
    }
}

/// HDFS connection parameters, forwarded to the HDFS client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HdfsConfig {
    /// Name node URI; `default` selects the client's configured filesystem.
    pub name_node_uri: String,
    pub username: Option<String>,
    pub kerb_ticket_cache_path: Option<String>,
}

impl Default for HdfsConfig {
    fn default() -> Self {
        Self {
            name_node_uri: "default".into(),
            username: None,
            kerb_ticket_cache_path: None,
        }
    }
}
