//! HDFS backend.
//!
//! One connection is established per VFS instance at construction and lives
//! for the lifetime of the backend. The client speaks libhdfs underneath and
//! mirrors `std::fs`, so errors arrive as `std::io::Error` and are wrapped
//! with the scheme tag here. Filelocks are handled by the dispatcher as
//! no-ops; HDFS offers no byte-range locks.

use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

use tiledb_common::{log_status, HdfsConfig, Result, Status, Uri};

use crate::backend::Backend;

pub struct Hdfs {
    client: hdrs::Client,
}

impl Hdfs {
    /// Connect to the name node named by the configuration.
    ///
    /// The connection is not explicitly closed at drop; tearing it down has
    /// been observed to hang, so the handle is released as-is.
    pub fn connect(config: &HdfsConfig) -> Result<Self> {
        let mut builder = hdrs::ClientBuilder::new(&config.name_node_uri);
        if let Some(user) = &config.username {
            builder = builder.with_user(user);
        }
        if let Some(path) = &config.kerb_ticket_cache_path {
            builder = builder.with_kerberos_ticket_cache_path(path);
        }
        let client = builder.connect().map_err(|e| {
            log_status(Status::vfs_error(format!(
                "hdfs: cannot connect to '{}': {}",
                config.name_node_uri, e
            )))
        })?;
        Ok(Self { client })
    }

    fn io_status(op: &str, uri: &Uri, e: std::io::Error) -> Status {
        let msg = format!("hdfs: cannot {} '{}': {}", op, uri, e);
        let status = match e.kind() {
            ErrorKind::NotFound => Status::not_found(msg),
            ErrorKind::AlreadyExists => Status::already_exists(msg),
            _ => Status::vfs_error(msg),
        };
        log_status(status)
    }

    /// Rebuild a full `hdfs://authority/...` URI around a client-native path.
    fn with_authority(parent: &Uri, path: &str) -> String {
        format!("hdfs://{}{}", parent.authority(), path)
    }
}

impl Backend for Hdfs {
    fn create_dir(&self, uri: &Uri) -> Result<()> {
        self.client
            .create_dir(uri.path_part())
            .map_err(|e| Self::io_status("create directory", uri, e))
    }

    fn create_file(&self, uri: &Uri) -> Result<()> {
        self.client
            .open_file()
            .create(true)
            .write(true)
            .open(uri.path_part())
            .map(|_| ())
            .map_err(|e| Self::io_status("create file", uri, e))
    }

    fn remove_path(&self, uri: &Uri) -> Result<()> {
        if self.is_dir(uri) {
            self.client
                .remove_dir_all(uri.path_part())
                .map_err(|e| Self::io_status("remove path", uri, e))
        } else if self.is_file(uri) {
            self.client
                .remove_file(uri.path_part())
                .map_err(|e| Self::io_status("remove path", uri, e))
        } else {
            Ok(())
        }
    }

    fn remove_file(&self, uri: &Uri) -> Result<()> {
        self.client
            .remove_file(uri.path_part())
            .map_err(|e| Self::io_status("remove file", uri, e))
    }

    fn file_size(&self, uri: &Uri) -> Result<u64> {
        let metadata = self
            .client
            .metadata(uri.path_part())
            .map_err(|e| Self::io_status("get size of", uri, e))?;
        if !metadata.is_file() {
            return Err(log_status(Status::vfs_error(format!(
                "hdfs: cannot get size of '{}': not a regular file",
                uri
            ))));
        }
        Ok(metadata.len())
    }

    fn is_dir(&self, uri: &Uri) -> bool {
        self.client
            .metadata(uri.path_part())
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    fn is_file(&self, uri: &Uri) -> bool {
        self.client
            .metadata(uri.path_part())
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    fn ls(&self, parent: &Uri) -> Result<Vec<String>> {
        let entries = self
            .client
            .read_dir(parent.path_part())
            .map_err(|e| Self::io_status("list", parent, e))?;
        Ok(entries
            .into_iter()
            .map(|entry| Self::with_authority(parent, entry.path()))
            .collect())
    }

    fn read(&self, uri: &Uri, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let mut file = self
            .client
            .open_file()
            .read(true)
            .open(uri.path_part())
            .map_err(|e| Self::io_status("read", uri, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Self::io_status("seek", uri, e))?;
        file.read_exact(buffer).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => log_status(Status::vfs_error(format!(
                "hdfs: cannot read '{}': fewer than {} bytes available at offset {}",
                uri,
                buffer.len(),
                offset
            ))),
            _ => Self::io_status("read", uri, e),
        })
    }

    fn write(&self, uri: &Uri, buffer: &[u8]) -> Result<()> {
        let mut file = self
            .client
            .open_file()
            .append(true)
            .create(true)
            .open(uri.path_part())
            .map_err(|e| Self::io_status("write", uri, e))?;
        file.write_all(buffer)
            .map_err(|e| Self::io_status("write", uri, e))
    }

    fn sync(&self, uri: &Uri) -> Result<()> {
        let mut file = self
            .client
            .open_file()
            .append(true)
            .open(uri.path_part())
            .map_err(|e| Self::io_status("sync", uri, e))?;
        file.flush().map_err(|e| Self::io_status("sync", uri, e))
    }

    fn move_path(&self, old_uri: &Uri, new_uri: &Uri) -> Result<()> {
        self.client
            .rename_file(old_uri.path_part(), new_uri.path_part())
            .map_err(|e| Self::io_status("move", old_uri, e))
    }
}
