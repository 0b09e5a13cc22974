//! Local filesystem backend.
//!
//! Paths arrive as `file://` URIs already normalized to absolute form. All
//! operations go through `std::fs`; filelocks use advisory whole-file
//! `flock(2)` locks held through an owning token.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use tiledb_common::{log_status, Result, Status, Uri};

use crate::backend::Backend;
use crate::filelock::Filelock;

pub struct Posix;

impl Posix {
    fn path_of(uri: &Uri) -> PathBuf {
        PathBuf::from(uri.to_path())
    }

    fn io_status(op: &str, path: &Path, e: std::io::Error) -> Status {
        let msg = format!("posix: cannot {} '{}': {}", op, path.display(), e);
        let status = match e.kind() {
            ErrorKind::NotFound => Status::not_found(msg),
            ErrorKind::AlreadyExists => Status::already_exists(msg),
            _ => Status::vfs_error(msg),
        };
        log_status(status)
    }

    /// Take an advisory whole-file lock on an existing file. `shared` selects
    /// a read lock; otherwise the lock is exclusive. Blocks until granted.
    pub fn filelock_lock(&self, path: &Path, shared: bool) -> Result<Filelock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Self::io_status("open filelock", path, e))?;
        let arg = if shared {
            FlockArg::LockShared
        } else {
            FlockArg::LockExclusive
        };
        match Flock::lock(file, arg) {
            Ok(lock) => Ok(Filelock::local(lock)),
            Err((_file, errno)) => Err(log_status(Status::vfs_error(format!(
                "posix: cannot lock '{}': {}",
                path.display(),
                errno
            )))),
        }
    }
}

impl Backend for Posix {
    fn create_dir(&self, uri: &Uri) -> Result<()> {
        let path = Self::path_of(uri);
        fs::create_dir(&path).map_err(|e| Self::io_status("create directory", &path, e))
    }

    fn create_file(&self, uri: &Uri) -> Result<()> {
        let path = Self::path_of(uri);
        OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .map(|_| ())
            .map_err(|e| Self::io_status("create file", &path, e))
    }

    fn remove_path(&self, uri: &Uri) -> Result<()> {
        let path = Self::path_of(uri);
        if self.is_dir(uri) {
            fs::remove_dir_all(&path).map_err(|e| Self::io_status("remove path", &path, e))
        } else if self.is_file(uri) {
            fs::remove_file(&path).map_err(|e| Self::io_status("remove path", &path, e))
        } else {
            // Removing something that is not there already succeeded.
            Ok(())
        }
    }

    fn remove_file(&self, uri: &Uri) -> Result<()> {
        let path = Self::path_of(uri);
        fs::remove_file(&path).map_err(|e| Self::io_status("remove file", &path, e))
    }

    fn file_size(&self, uri: &Uri) -> Result<u64> {
        let path = Self::path_of(uri);
        let metadata =
            fs::metadata(&path).map_err(|e| Self::io_status("get size of", &path, e))?;
        if !metadata.is_file() {
            return Err(log_status(Status::vfs_error(format!(
                "posix: cannot get size of '{}': not a regular file",
                path.display()
            ))));
        }
        Ok(metadata.len())
    }

    fn is_dir(&self, uri: &Uri) -> bool {
        fs::metadata(Self::path_of(uri))
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    fn is_file(&self, uri: &Uri) -> bool {
        fs::metadata(Self::path_of(uri))
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    fn ls(&self, parent: &Uri) -> Result<Vec<String>> {
        let path = Self::path_of(parent);
        let entries = fs::read_dir(&path).map_err(|e| Self::io_status("list", &path, e))?;
        let mut children = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Self::io_status("list", &path, e))?;
            match entry.path().to_str() {
                Some(child) => children.push(child.to_string()),
                None => {
                    tracing::warn!(path = %entry.path().display(), "skipping non-UTF8 path");
                }
            }
        }
        Ok(children)
    }

    fn read(&self, uri: &Uri, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let path = Self::path_of(uri);
        let mut file = File::open(&path).map_err(|e| Self::io_status("read", &path, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Self::io_status("seek", &path, e))?;
        file.read_exact(buffer).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => log_status(Status::vfs_error(format!(
                "posix: cannot read '{}': fewer than {} bytes available at offset {}",
                path.display(),
                buffer.len(),
                offset
            ))),
            _ => Self::io_status("read", &path, e),
        })
    }

    fn write(&self, uri: &Uri, buffer: &[u8]) -> Result<()> {
        let path = Self::path_of(uri);
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| Self::io_status("write", &path, e))?;
        file.write_all(buffer)
            .map_err(|e| Self::io_status("write", &path, e))
    }

    fn sync(&self, uri: &Uri) -> Result<()> {
        let path = Self::path_of(uri);
        if self.is_dir(uri) {
            let file = File::open(&path).map_err(|e| Self::io_status("sync", &path, e))?;
            file.sync_all().map_err(|e| Self::io_status("sync", &path, e))
        } else if self.is_file(uri) {
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| Self::io_status("sync", &path, e))?;
            file.sync_all()
                .map_err(|e| Self::io_status("sync", &path, e))?;
            // The directory entry of a fresh file is only durable once the
            // parent directory is flushed as well.
            if let Some(parent) = path.parent() {
                let dir = File::open(parent).map_err(|e| Self::io_status("sync", parent, e))?;
                dir.sync_all().map_err(|e| Self::io_status("sync", parent, e))?;
            }
            Ok(())
        } else {
            Ok(())
        }
    }

    fn move_path(&self, old_uri: &Uri, new_uri: &Uri) -> Result<()> {
        let old_path = Self::path_of(old_uri);
        let new_path = Self::path_of(new_uri);
        fs::rename(&old_path, &new_path).map_err(|e| Self::io_status("move", &old_path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiledb_common::StatusCode;

    fn uri_for(path: &Path) -> Uri {
        Uri::new(path.to_str().unwrap())
    }

    #[test]
    fn test_create_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let posix = Posix;

        let subdir = uri_for(&dir.path().join("sub"));
        posix.create_dir(&subdir).unwrap();
        assert!(posix.is_dir(&subdir));

        let file = uri_for(&dir.path().join("sub").join("data.bin"));
        posix.create_file(&file).unwrap();
        assert!(posix.is_file(&file));
        assert_eq!(posix.file_size(&file).unwrap(), 0);

        // create_file leaves an existing file alone.
        posix.write(&file, b"abc").unwrap();
        posix.create_file(&file).unwrap();
        assert_eq!(posix.file_size(&file).unwrap(), 3);

        // remove_file refuses directories; remove_path takes them whole.
        assert!(posix.remove_file(&subdir).is_err());
        posix.remove_path(&subdir).unwrap();
        assert!(!posix.is_dir(&subdir));

        // Removing a missing path is ok; removing a missing file is not.
        posix.remove_path(&subdir).unwrap();
        let err = posix.remove_file(&file).unwrap_err();
        assert_eq!(err.code(), StatusCode::NotFound);
    }

    #[test]
    fn test_write_is_append() {
        let dir = tempfile::tempdir().unwrap();
        let posix = Posix;
        let file = uri_for(&dir.path().join("log"));

        posix.write(&file, b"hello ").unwrap();
        posix.write(&file, b"world").unwrap();
        posix.sync(&file).unwrap();

        let mut buffer = vec![0u8; 11];
        posix.read(&file, 0, &mut buffer).unwrap();
        assert_eq!(&buffer, b"hello world");
    }

    #[test]
    fn test_short_read_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let posix = Posix;
        let file = uri_for(&dir.path().join("small"));
        posix.write(&file, b"1234").unwrap();

        let mut buffer = vec![0u8; 16];
        let err = posix.read(&file, 0, &mut buffer).unwrap_err();
        assert!(err.message().unwrap().contains("fewer"));
    }

    #[test]
    fn test_read_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let posix = Posix;
        let file = uri_for(&dir.path().join("ranged"));
        posix.write(&file, b"0123456789").unwrap();

        let mut buffer = vec![0u8; 4];
        posix.read(&file, 3, &mut buffer).unwrap();
        assert_eq!(&buffer, b"3456");
    }

    #[test]
    fn test_move_path() {
        let dir = tempfile::tempdir().unwrap();
        let posix = Posix;
        let src = uri_for(&dir.path().join("src"));
        let dst = uri_for(&dir.path().join("dst"));
        posix.write(&src, b"payload").unwrap();

        posix.move_path(&src, &dst).unwrap();
        assert!(!posix.is_file(&src));
        assert_eq!(posix.file_size(&dst).unwrap(), 7);
    }

    #[test]
    fn test_filelock_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let posix = Posix;
        let lock_uri = uri_for(&dir.path().join("lock"));
        posix.create_file(&lock_uri).unwrap();
        let lock_path = dir.path().join("lock");

        let exclusive = posix.filelock_lock(&lock_path, false).unwrap();
        exclusive.unlock().unwrap();

        // Relocking after an unlock succeeds, shared locks included.
        let shared = posix.filelock_lock(&lock_path, true).unwrap();
        shared.unlock().unwrap();
    }

    #[test]
    fn test_filelock_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let posix = Posix;
        let err = posix
            .filelock_lock(&dir.path().join("absent"), false)
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::NotFound);
    }
}
