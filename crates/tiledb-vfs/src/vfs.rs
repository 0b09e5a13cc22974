//! The VFS dispatcher.
//!
//! A [`Vfs`] value owns one backend instance per compiled-in scheme, the set
//! of supported backends, a worker thread pool and the parallel-read
//! threshold. Every operation classifies its URI, routes to the matching
//! backend, and returns a `Status`-typed result; a recognized scheme whose
//! backend is not compiled in fails with a not-built-with status rather than
//! misrouting.

use std::cmp::min;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tiledb_common::{
    log_status, Filesystem, Result, Scheme, Status, Uri, VfsConfig, VfsMode,
};

use crate::backend::Backend;
use crate::filelock::Filelock;
use crate::posix::Posix;
use crate::thread_pool::{TaskResult, ThreadPool};

#[cfg(feature = "hdfs")]
use crate::hdfs::Hdfs;
#[cfg(feature = "s3")]
use crate::s3::S3;

pub struct Vfs {
    posix: Arc<Posix>,
    #[cfg(feature = "hdfs")]
    hdfs: Arc<Hdfs>,
    #[cfg(feature = "s3")]
    s3: Arc<S3>,
    supported_fs: HashSet<Filesystem>,
    thread_pool: ThreadPool,
    parallel_read_threshold: u64,
}

impl Vfs {
    /// Initialize the virtual filesystem from a validated configuration.
    /// Remote backends connect here; the configuration is immutable after.
    pub fn new(config: &VfsConfig) -> Result<Self> {
        config.validate()?;

        let mut supported_fs = HashSet::new();
        if cfg!(feature = "hdfs") {
            supported_fs.insert(Filesystem::Hdfs);
        }
        if cfg!(feature = "s3") {
            supported_fs.insert(Filesystem::S3);
        }

        Ok(Self {
            posix: Arc::new(Posix),
            #[cfg(feature = "hdfs")]
            hdfs: Arc::new(Hdfs::connect(&config.hdfs)?),
            #[cfg(feature = "s3")]
            s3: Arc::new(S3::connect(&config.s3)?),
            supported_fs,
            thread_pool: ThreadPool::new(config.num_parallel_operations),
            parallel_read_threshold: config.parallel_read_threshold,
        })
    }

    /// The absolute form of a path string; see [`tiledb_common::abs_path`].
    pub fn abs_path(path: &str) -> String {
        tiledb_common::abs_path(path)
    }

    /// Whether this instance was built with the given backend.
    pub fn supports_fs(&self, fs: Filesystem) -> bool {
        self.supported_fs.contains(&fs)
    }

    /// Route a URI to its backend without logging; callers that propagate
    /// the failure wrap it in `log_status`.
    fn backend_for(&self, uri: &Uri) -> Result<Arc<dyn Backend>> {
        if uri.is_invalid() {
            return Err(Status::invalid_argument("empty URI"));
        }
        match uri.scheme() {
            Scheme::File => Ok(Arc::clone(&self.posix) as Arc<dyn Backend>),
            Scheme::Hdfs => self.hdfs_backend(),
            Scheme::S3 => self.s3_backend(),
            Scheme::Other => Err(Status::unsupported_scheme(format!(
                "unsupported URI scheme: '{}'",
                uri
            ))),
        }
    }

    #[cfg(feature = "hdfs")]
    fn hdfs_backend(&self) -> Result<Arc<dyn Backend>> {
        Ok(Arc::clone(&self.hdfs) as Arc<dyn Backend>)
    }

    #[cfg(not(feature = "hdfs"))]
    fn hdfs_backend(&self) -> Result<Arc<dyn Backend>> {
        Err(Status::not_built_with(Filesystem::Hdfs))
    }

    #[cfg(feature = "s3")]
    fn s3_backend(&self) -> Result<Arc<dyn Backend>> {
        Ok(Arc::clone(&self.s3) as Arc<dyn Backend>)
    }

    #[cfg(not(feature = "s3"))]
    fn s3_backend(&self) -> Result<Arc<dyn Backend>> {
        Err(Status::not_built_with(Filesystem::S3))
    }

    /// Create a directory. Creating an existing directory is a reported
    /// error; parents are not created implicitly.
    pub fn create_dir(&self, uri: &Uri) -> Result<()> {
        if self.is_dir(uri) {
            return Err(log_status(Status::already_exists(format!(
                "cannot create directory '{}'; directory already exists",
                uri
            ))));
        }
        self.backend_for(uri).map_err(log_status)?.create_dir(uri)
    }

    /// Create an empty file. Success if the file already exists.
    pub fn create_file(&self, uri: &Uri) -> Result<()> {
        if self.is_file(uri) {
            return Ok(());
        }
        self.backend_for(uri).map_err(log_status)?.create_file(uri)
    }

    /// Remove a path recursively. Removing a missing path is ok.
    pub fn remove_path(&self, uri: &Uri) -> Result<()> {
        self.backend_for(uri).map_err(log_status)?.remove_path(uri)
    }

    /// Remove a single file.
    pub fn remove_file(&self, uri: &Uri) -> Result<()> {
        self.backend_for(uri).map_err(log_status)?.remove_file(uri)
    }

    /// Size of a regular file in bytes.
    pub fn file_size(&self, uri: &Uri) -> Result<u64> {
        self.backend_for(uri).map_err(log_status)?.file_size(uri)
    }

    pub fn is_dir(&self, uri: &Uri) -> bool {
        match self.backend_for(uri) {
            Ok(backend) => backend.is_dir(uri),
            Err(_) => false,
        }
    }

    pub fn is_file(&self, uri: &Uri) -> bool {
        match self.backend_for(uri) {
            Ok(backend) => backend.is_file(uri),
            Err(_) => false,
        }
    }

    /// The children of `parent`, sorted lexicographically.
    pub fn ls(&self, parent: &Uri) -> Result<Vec<Uri>> {
        let mut paths = self.backend_for(parent).map_err(log_status)?.ls(parent)?;
        paths.sort();
        Ok(paths.iter().map(|path| Uri::new(path)).collect())
    }

    /// Rename a path. Both URIs must share a scheme; moving across backends
    /// is rejected. With `force`, an existing destination is removed first —
    /// if the subsequent move then fails, the destination is already gone.
    /// That hazard is inherent to the forced variant.
    pub fn move_path(&self, old_uri: &Uri, new_uri: &Uri, force: bool) -> Result<()> {
        if old_uri.scheme() != new_uri.scheme() {
            return Err(log_status(Status::vfs_error(format!(
                "cross-backend move from '{}' to '{}' is not supported",
                old_uri, new_uri
            ))));
        }
        if force && (self.is_dir(new_uri) || self.is_file(new_uri)) {
            self.remove_path(new_uri)?;
        }
        self.backend_for(old_uri)
            .map_err(log_status)?
            .move_path(old_uri, new_uri)
    }

    /// Read exactly `buffer.len()` bytes at `offset`.
    ///
    /// Reads at or above the parallel-read threshold are split into
    /// contiguous shards, one pool task each, writing into disjoint regions
    /// of `buffer` in place. Shards always run to completion; on failure the
    /// lowest-indexed failing shard's status is returned.
    pub fn read(&self, uri: &Uri, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let backend = self.backend_for(uri).map_err(log_status)?;
        if !backend.is_file(uri) {
            return Err(log_status(Status::not_found(format!(
                "cannot read from '{}'; file does not exist",
                uri
            ))));
        }

        let nbytes = buffer.len() as u64;
        let num_shards = if nbytes < self.parallel_read_threshold {
            1
        } else {
            min(
                self.thread_pool.num_threads() as u64,
                nbytes.div_ceil(self.parallel_read_threshold),
            )
        };
        if num_shards <= 1 {
            return backend.read(uri, offset, buffer);
        }

        let shard_nbytes = nbytes.div_ceil(num_shards) as usize;
        let mut results: Vec<TaskResult> = Vec::with_capacity(num_shards as usize);
        for (i, shard) in buffer.chunks_mut(shard_nbytes).enumerate() {
            let shard_offset = offset + (i * shard_nbytes) as u64;
            // SAFETY: every shard handle is waited on below before this
            // function returns, so no task outlives the borrow of `buffer`,
            // and chunks_mut regions are disjoint.
            let shard: &'static mut [u8] =
                unsafe { std::mem::transmute::<&mut [u8], &'static mut [u8]>(shard) };
            let backend = Arc::clone(&backend);
            let uri = uri.clone();
            results.push(self.thread_pool.enqueue_with_result(move || {
                match backend.read(&uri, shard_offset, shard) {
                    Ok(()) => Status::ok(),
                    Err(status) => status,
                }
            }));
        }

        // Wait for every shard before inspecting any status, so no task can
        // be left running past this call.
        let statuses: Vec<Status> = results.into_iter().map(TaskResult::wait).collect();
        for status in statuses {
            if !status.is_ok() {
                return Err(log_status(status));
            }
        }
        Ok(())
    }

    /// Append `buffer` to the file named by `uri`.
    pub fn write(&self, uri: &Uri, buffer: &[u8]) -> Result<()> {
        self.backend_for(uri).map_err(log_status)?.write(uri, buffer)
    }

    /// Durably flush a file. A no-op on S3, where durability happens at
    /// [`Vfs::close_file`].
    pub fn sync(&self, uri: &Uri) -> Result<()> {
        self.backend_for(uri).map_err(log_status)?.sync(uri)
    }

    /// Check that a file may be opened in the given mode. Open state is
    /// advisory: no handle is tracked, and closing a never-opened file is
    /// permitted.
    ///
    /// `Read` requires the file to exist; `Write` removes an existing file
    /// (truncate semantics); `Append` is rejected on S3.
    pub fn open_file(&self, uri: &Uri, mode: VfsMode) -> Result<()> {
        // Surface malformed URIs and unrouteable schemes before probing
        // existence, so an argument error never reads as not-found.
        let _ = self.backend_for(uri).map_err(log_status)?;
        match mode {
            VfsMode::Read => {
                if !self.is_file(uri) {
                    return Err(log_status(Status::not_found(format!(
                        "cannot open file '{}'; file does not exist",
                        uri
                    ))));
                }
                Ok(())
            }
            VfsMode::Write => {
                if self.is_file(uri) {
                    return self.remove_file(uri);
                }
                Ok(())
            }
            VfsMode::Append => {
                if uri.is_s3() {
                    return Err(log_status(self.s3_append_rejection(uri)));
                }
                Ok(())
            }
        }
    }

    #[cfg(feature = "s3")]
    fn s3_append_rejection(&self, uri: &Uri) -> Status {
        Status::invalid_argument(format!(
            "cannot open file '{}'; S3 does not support append mode",
            uri
        ))
    }

    #[cfg(not(feature = "s3"))]
    fn s3_append_rejection(&self, _uri: &Uri) -> Status {
        Status::not_built_with(Filesystem::S3)
    }

    /// Close a file, flushing it to persistent storage: `sync` on local and
    /// HDFS, multipart completion on S3.
    pub fn close_file(&self, uri: &Uri) -> Result<()> {
        match uri.scheme() {
            Scheme::S3 => self.s3_flush(uri),
            _ => self.sync(uri),
        }
    }

    #[cfg(feature = "s3")]
    fn s3_flush(&self, uri: &Uri) -> Result<()> {
        self.s3.flush_file(uri)
    }

    #[cfg(not(feature = "s3"))]
    fn s3_flush(&self, _uri: &Uri) -> Result<()> {
        Err(log_status(Status::not_built_with(Filesystem::S3)))
    }

    /// Acquire a filelock. Real and advisory on the local backend; on remote
    /// backends locks are no-ops that still produce a well-formed token.
    pub fn filelock_lock(&self, uri: &Uri, shared: bool) -> Result<Filelock> {
        match uri.scheme() {
            Scheme::File => self.posix.filelock_lock(Path::new(&uri.to_path()), shared),
            Scheme::Hdfs => self.remote_lock(Filesystem::Hdfs),
            Scheme::S3 => self.remote_lock(Filesystem::S3),
            Scheme::Other => Err(log_status(Status::unsupported_scheme(format!(
                "unsupported URI scheme: '{}'",
                uri
            )))),
        }
    }

    fn remote_lock(&self, fs: Filesystem) -> Result<Filelock> {
        if self.supports_fs(fs) {
            Ok(Filelock::remote())
        } else {
            Err(log_status(Status::not_built_with(fs)))
        }
    }

    /// Release a filelock token obtained from [`Vfs::filelock_lock`].
    pub fn filelock_unlock(&self, lock: Filelock) -> Result<()> {
        lock.unlock()
    }
}

// Bucket operations are only meaningful on object-store backends; every
// other scheme fails with an unsupported-scheme status.
impl Vfs {
    fn check_bucket_scheme(uri: &Uri, op: &str) -> Result<()> {
        if uri.is_s3() {
            Ok(())
        } else {
            Err(log_status(Status::unsupported_scheme(format!(
                "cannot {}; unsupported URI scheme: '{}'",
                op, uri
            ))))
        }
    }
}

#[cfg(feature = "s3")]
impl Vfs {
    pub fn create_bucket(&self, uri: &Uri) -> Result<()> {
        Self::check_bucket_scheme(uri, "create bucket")?;
        self.s3.create_bucket(uri)
    }

    pub fn remove_bucket(&self, uri: &Uri) -> Result<()> {
        Self::check_bucket_scheme(uri, "remove bucket")?;
        self.s3.remove_bucket(uri)
    }

    pub fn empty_bucket(&self, uri: &Uri) -> Result<()> {
        Self::check_bucket_scheme(uri, "empty bucket")?;
        self.s3.empty_bucket(uri)
    }

    pub fn is_empty_bucket(&self, uri: &Uri) -> Result<bool> {
        Self::check_bucket_scheme(uri, "inspect bucket")?;
        self.s3.is_empty_bucket(uri)
    }

    pub fn is_bucket(&self, uri: &Uri) -> bool {
        uri.is_s3() && self.s3.is_bucket(uri)
    }
}

#[cfg(not(feature = "s3"))]
impl Vfs {
    pub fn create_bucket(&self, uri: &Uri) -> Result<()> {
        Self::check_bucket_scheme(uri, "create bucket")?;
        Err(log_status(Status::not_built_with(Filesystem::S3)))
    }

    pub fn remove_bucket(&self, uri: &Uri) -> Result<()> {
        Self::check_bucket_scheme(uri, "remove bucket")?;
        Err(log_status(Status::not_built_with(Filesystem::S3)))
    }

    pub fn empty_bucket(&self, uri: &Uri) -> Result<()> {
        Self::check_bucket_scheme(uri, "empty bucket")?;
        Err(log_status(Status::not_built_with(Filesystem::S3)))
    }

    pub fn is_empty_bucket(&self, uri: &Uri) -> Result<bool> {
        Self::check_bucket_scheme(uri, "inspect bucket")?;
        Err(log_status(Status::not_built_with(Filesystem::S3)))
    }

    pub fn is_bucket(&self, _uri: &Uri) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiledb_common::StatusCode;

    fn test_vfs(num_workers: usize, threshold: u64) -> Vfs {
        let config = VfsConfig {
            num_parallel_operations: num_workers,
            parallel_read_threshold: threshold,
            ..Default::default()
        };
        Vfs::new(&config).unwrap()
    }

    fn uri_for(path: &std::path::Path) -> Uri {
        Uri::new(path.to_str().unwrap())
    }

    #[test]
    fn test_write_sync_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = test_vfs(2, 1024 * 1024);
        let file = uri_for(&dir.path().join("roundtrip"));

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        vfs.write(&file, &payload).unwrap();
        vfs.sync(&file).unwrap();

        let mut readback = vec![0u8; payload.len()];
        vfs.read(&file, 0, &mut readback).unwrap();
        assert_eq!(readback, payload);
    }

    #[test]
    fn test_sharded_read_matches_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = test_vfs(4, 1024 * 1024);
        let file = uri_for(&dir.path().join("sharded"));

        // 16 MiB of i % 256.
        const FILE_SIZE: usize = 16 * 1024 * 1024;
        let payload: Vec<u8> = (0..FILE_SIZE).map(|i| (i % 256) as u8).collect();
        vfs.write(&file, &payload).unwrap();
        vfs.sync(&file).unwrap();

        // Read 8 MiB starting at offset 1024: well above the threshold, so
        // the read shards across the pool.
        const OFFSET: usize = 1024;
        const READ_SIZE: usize = 8 * 1024 * 1024;
        let mut buffer = vec![0u8; READ_SIZE];
        vfs.read(&file, OFFSET as u64, &mut buffer).unwrap();
        for (i, byte) in buffer.iter().enumerate() {
            assert_eq!(*byte as usize, (OFFSET + i) % 256, "mismatch at {}", i);
        }
    }

    #[test]
    fn test_sharded_equals_unsharded() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("compare");

        let payload: Vec<u8> = (0..3 * 1024 * 1024usize).map(|i| (i * 7 % 256) as u8).collect();

        let sharding = test_vfs(4, 1024 * 1024);
        let file = uri_for(&file_path);
        sharding.write(&file, &payload).unwrap();
        sharding.sync(&file).unwrap();

        let mut sharded = vec![0u8; payload.len()];
        sharding.read(&file, 0, &mut sharded).unwrap();

        let single = test_vfs(1, u64::MAX);
        let mut unsharded = vec![0u8; payload.len()];
        single.read(&file, 0, &mut unsharded).unwrap();

        assert_eq!(sharded, unsharded);
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = test_vfs(1, 1024);
        let missing = uri_for(&dir.path().join("missing"));
        let mut buffer = [0u8; 8];
        let err = vfs.read(&missing, 0, &mut buffer).unwrap_err();
        assert_eq!(err.code(), StatusCode::NotFound);
    }

    #[test]
    fn test_ls_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = test_vfs(1, 1024);

        // Created out of order on purpose.
        for name in ["a", "c", "b"] {
            vfs.create_file(&uri_for(&dir.path().join(name))).unwrap();
        }
        let children = vfs.ls(&uri_for(dir.path())).unwrap();
        let names: Vec<&str> = children.iter().map(|u| u.last_path_part()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_create_dir_twice_reports_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = test_vfs(1, 1024);
        let subdir = uri_for(&dir.path().join("sub"));

        vfs.create_dir(&subdir).unwrap();
        let err = vfs.create_dir(&subdir).unwrap_err();
        assert_eq!(err.code(), StatusCode::AlreadyExists);
    }

    #[test]
    fn test_cross_backend_move_is_rejected() {
        let vfs = test_vfs(1, 1024);
        let local = Uri::new("/tmp/a");
        let remote = Uri::new("s3://bucket/a");
        let err = vfs.move_path(&local, &remote, false).unwrap_err();
        assert!(err.message().unwrap().contains("cross-backend"));
    }

    #[test]
    fn test_move_path_force_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = test_vfs(1, 1024);
        let src = uri_for(&dir.path().join("src"));
        let dst = uri_for(&dir.path().join("dst"));

        vfs.write(&src, b"new").unwrap();
        vfs.write(&dst, b"old").unwrap();

        // Without force the destination blocks some backends; with force it
        // is removed first.
        vfs.move_path(&src, &dst, true).unwrap();
        assert_eq!(vfs.file_size(&dst).unwrap(), 3);
        let mut buffer = [0u8; 3];
        vfs.read(&dst, 0, &mut buffer).unwrap();
        assert_eq!(&buffer, b"new");
        assert!(!vfs.is_file(&src));
    }

    #[test]
    fn test_open_file_modes() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = test_vfs(1, 1024);
        let file = uri_for(&dir.path().join("modes"));

        // Read requires existence.
        let err = vfs.open_file(&file, VfsMode::Read).unwrap_err();
        assert_eq!(err.code(), StatusCode::NotFound);

        // Write truncates an existing file away.
        vfs.write(&file, b"stale").unwrap();
        vfs.open_file(&file, VfsMode::Write).unwrap();
        assert!(!vfs.is_file(&file));

        // Append on local backends is fine.
        vfs.write(&file, b"fresh").unwrap();
        vfs.open_file(&file, VfsMode::Append).unwrap();
        vfs.close_file(&file).unwrap();
    }

    #[cfg(feature = "s3")]
    #[test]
    fn test_s3_append_is_rejected() {
        let vfs = test_vfs(1, 1024);
        let key = Uri::new("s3://bucket/object");
        let err = vfs.open_file(&key, VfsMode::Append).unwrap_err();
        let msg = err.message().unwrap();
        assert!(msg.contains("append"));
        assert!(msg.contains("S3"));
    }

    #[cfg(not(feature = "s3"))]
    #[test]
    fn test_s3_operations_without_backend() {
        let vfs = test_vfs(1, 1024);
        let key = Uri::new("s3://bucket/object");

        assert!(!vfs.supports_fs(Filesystem::S3));
        let err = vfs.write(&key, b"data").unwrap_err();
        assert_eq!(err.code(), StatusCode::NotBuiltWith);
        let err = vfs.create_bucket(&key).unwrap_err();
        assert_eq!(err.code(), StatusCode::NotBuiltWith);
        assert!(!vfs.is_bucket(&key));
        assert!(!vfs.is_file(&key));
    }

    #[test]
    fn test_unrecognized_scheme() {
        let vfs = test_vfs(1, 1024);
        let odd = Uri::new("gopher://hole/file");
        let err = vfs.sync(&odd).unwrap_err();
        assert_eq!(err.code(), StatusCode::UnsupportedScheme);
    }

    #[test]
    fn test_empty_uri_is_invalid_argument() {
        let vfs = test_vfs(1, 1024);
        let empty = Uri::new("");

        let err = vfs.file_size(&empty).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);

        // A malformed URI is an argument error, not a missing file.
        let mut buffer = [0u8; 4];
        let err = vfs.read(&empty, 0, &mut buffer).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        let err = vfs.open_file(&empty, VfsMode::Read).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
    }

    #[test]
    fn test_bucket_ops_reject_local_uris() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = test_vfs(1, 1024);
        let local = uri_for(dir.path());
        let err = vfs.create_bucket(&local).unwrap_err();
        assert_eq!(err.code(), StatusCode::UnsupportedScheme);
    }

    #[test]
    fn test_filelock_roundtrip_through_vfs() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = test_vfs(1, 1024);
        let lock_uri = uri_for(&dir.path().join("lockfile"));
        vfs.create_file(&lock_uri).unwrap();

        let lock = vfs.filelock_lock(&lock_uri, false).unwrap();
        vfs.filelock_unlock(lock).unwrap();

        let relock = vfs.filelock_lock(&lock_uri, true).unwrap();
        vfs.filelock_unlock(relock).unwrap();
    }

    #[test]
    fn test_remove_path_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = test_vfs(1, 1024);

        let tree = uri_for(&dir.path().join("tree"));
        vfs.create_dir(&tree).unwrap();
        vfs.create_dir(&tree.join_path("nested")).unwrap();
        vfs.write(&tree.join_path("nested/file"), b"x").unwrap();

        vfs.remove_path(&tree).unwrap();
        assert!(!vfs.is_dir(&tree));
        // A second removal of the same path is still ok.
        vfs.remove_path(&tree).unwrap();
    }
}
