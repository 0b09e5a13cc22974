use std::fmt;

/// The intent a file is opened with.
///
/// `Write` truncates an existing file; `Append` extends it. S3 cannot
/// append, so `Append` is rejected at open time on that backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VfsMode {
    Read,
    Write,
    Append,
}

impl fmt::Display for VfsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VfsMode::Read => f.write_str("read"),
            VfsMode::Write => f.write_str("write"),
            VfsMode::Append => f.write_str("append"),
        }
    }
}
