use std::fmt;

/// The remote backends a build may carry. The local filesystem is always
/// present and needs no tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filesystem {
    Hdfs,
    S3,
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filesystem::Hdfs => f.write_str("HDFS"),
            Filesystem::S3 => f.write_str("S3"),
        }
    }
}
