use tiledb_common::{Result, Uri};

/// The capability set every storage backend implements.
///
/// All operations are synchronous and blocking; the dispatcher supplies any
/// parallelism from its thread pool. Implementations must be safe to call
/// from multiple threads and serialize their own mutable state.
pub trait Backend: Send + Sync {
    /// Create a directory. Non-recursive; callers create parents explicitly.
    fn create_dir(&self, uri: &Uri) -> Result<()>;

    /// Create an empty file. The dispatcher already treats an existing file
    /// as success, so implementations only handle the create itself.
    fn create_file(&self, uri: &Uri) -> Result<()>;

    /// Remove a path recursively. Removing a missing path is ok.
    fn remove_path(&self, uri: &Uri) -> Result<()>;

    /// Remove a single file. Fails on directories and missing files.
    fn remove_file(&self, uri: &Uri) -> Result<()>;

    /// Size of a regular file in bytes.
    fn file_size(&self, uri: &Uri) -> Result<u64>;

    /// Whether the URI names a directory. Never fails; absence is `false`.
    fn is_dir(&self, uri: &Uri) -> bool;

    /// Whether the URI names a file. Never fails; absence is `false`.
    fn is_file(&self, uri: &Uri) -> bool;

    /// The immediate children of `parent`, as raw URI strings in no
    /// particular order. The dispatcher sorts.
    fn ls(&self, parent: &Uri) -> Result<Vec<String>>;

    /// Read exactly `buffer.len()` bytes starting at `offset`. A short read
    /// is a failure, not partial success.
    fn read(&self, uri: &Uri, offset: u64, buffer: &mut [u8]) -> Result<()>;

    /// Append `buffer` to the file, creating it if needed.
    fn write(&self, uri: &Uri, buffer: &[u8]) -> Result<()>;

    /// Durably flush the file. A no-op on S3, where durability happens at
    /// `flush_file`.
    fn sync(&self, uri: &Uri) -> Result<()>;

    /// Rename a path within this backend.
    fn move_path(&self, old_uri: &Uri, new_uri: &Uri) -> Result<()>;
}
