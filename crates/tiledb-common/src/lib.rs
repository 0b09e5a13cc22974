//! Shared value types for the storage engine: the status spine, URI
//! classification, open modes, backend tags, configuration and logging.

pub mod config;
pub mod filesystem;
pub mod logging;
pub mod mode;
pub mod status;
pub mod uri;

// Re-export commonly used items at the crate root.
pub use config::{ConfigError, HdfsConfig, S3Config, VfsConfig};
pub use filesystem::Filesystem;
pub use logging::{init_logging, LogConfig};
pub use mode::VfsMode;
pub use status::{log_status, Result, Status, StatusCode};
pub use uri::{abs_path, Scheme, Uri};
