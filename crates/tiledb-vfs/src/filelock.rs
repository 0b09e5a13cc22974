use std::fmt;
use std::fs::File;

use nix::fcntl::Flock;

use tiledb_common::{log_status, Result, Status};

/// An opaque token for a held filelock.
///
/// On the local backend the token owns the advisory whole-file lock and the
/// open file behind it; [`Filelock::unlock`] consumes the token, so a double
/// unlock cannot be expressed. Dropping a token without unlocking also
/// releases the lock. Remote backends have no byte-range locks, so their
/// tokens are well-formed no-ops.
pub struct Filelock {
    inner: LockInner,
}

enum LockInner {
    Local(Flock<File>),
    Remote,
}

impl Filelock {
    pub(crate) fn local(lock: Flock<File>) -> Self {
        Self {
            inner: LockInner::Local(lock),
        }
    }

    pub(crate) fn remote() -> Self {
        Self {
            inner: LockInner::Remote,
        }
    }

    /// Release the lock.
    pub fn unlock(self) -> Result<()> {
        match self.inner {
            LockInner::Local(lock) => match lock.unlock() {
                Ok(_file) => Ok(()),
                Err((_lock, errno)) => Err(log_status(Status::vfs_error(format!(
                    "posix: cannot unlock filelock: {}",
                    errno
                )))),
            },
            LockInner::Remote => Ok(()),
        }
    }
}

impl fmt::Debug for Filelock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner {
            LockInner::Local(_) => f.write_str("Filelock::Local"),
            LockInner::Remote => f.write_str("Filelock::Remote"),
        }
    }
}
