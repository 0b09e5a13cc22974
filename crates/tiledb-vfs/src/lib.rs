//! A virtual filesystem that routes file and directory operations to a
//! storage backend based on the URI scheme: local disk always, HDFS and S3
//! when compiled in (`hdfs` / `s3` features). Large reads are sharded across
//! an owned worker thread pool; everything else is synchronous and blocking.
//!
//! The VFS knows nothing about the array layer above it — only URIs, byte
//! ranges, directories and locks.

pub mod backend;
pub mod filelock;
#[cfg(feature = "hdfs")]
pub mod hdfs;
pub mod posix;
#[cfg(feature = "s3")]
pub mod s3;
pub mod thread_pool;
pub mod vfs;

pub use backend::Backend;
pub use filelock::Filelock;
pub use thread_pool::{TaskResult, ThreadPool};
pub use vfs::Vfs;
