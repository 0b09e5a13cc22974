use std::fmt;

use crate::filesystem::Filesystem;

/// The outcome classes a storage operation can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    /// A backend (OS, HDFS or S3) failure, wrapped with the originating
    /// scheme in the message.
    VfsError,
    OutOfMemory,
    /// The URI carries a scheme outside the recognized set.
    UnsupportedScheme,
    /// The scheme is recognized but this build does not carry the backend.
    NotBuiltWith,
    InvalidArgument,
    NotFound,
    AlreadyExists,
}

impl StatusCode {
    pub fn name(&self) -> &'static str {
        match self {
            StatusCode::Ok => "Ok",
            StatusCode::VfsError => "VFSError",
            StatusCode::OutOfMemory => "OutOfMemory",
            StatusCode::UnsupportedScheme => "UnsupportedScheme",
            StatusCode::NotBuiltWith => "NotBuiltWith",
            StatusCode::InvalidArgument => "InvalidArgument",
            StatusCode::NotFound => "NotFound",
            StatusCode::AlreadyExists => "AlreadyExists",
        }
    }
}

/// A status value carrying a code and an optional message.
///
/// The `#[must_use]` attribute ensures callers do not silently ignore error
/// statuses.
#[derive(Debug, Clone)]
#[must_use]
pub struct Status {
    code: StatusCode,
    message: Option<String>,
}

impl Status {
    /// The success status.
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: None,
        }
    }

    /// Create a status with a code and a descriptive message.
    pub fn with_message(code: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(msg.into()),
        }
    }

    pub fn vfs_error(msg: impl Into<String>) -> Self {
        Self::with_message(StatusCode::VfsError, msg)
    }

    pub fn out_of_memory(msg: impl Into<String>) -> Self {
        Self::with_message(StatusCode::OutOfMemory, msg)
    }

    pub fn unsupported_scheme(msg: impl Into<String>) -> Self {
        Self::with_message(StatusCode::UnsupportedScheme, msg)
    }

    /// The backend for `fs` was not compiled into this build.
    pub fn not_built_with(fs: Filesystem) -> Self {
        Self::with_message(
            StatusCode::NotBuiltWith,
            format!("built without {} support", fs),
        )
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::with_message(StatusCode::InvalidArgument, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::with_message(StatusCode::NotFound, msg)
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::with_message(StatusCode::AlreadyExists, msg)
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Whether this status represents success.
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.code.name(), msg),
            None => f.write_str(self.code.name()),
        }
    }
}

impl std::error::Error for Status {}

/// The standard result type of the storage layer, with `Status` as the error.
pub type Result<T> = std::result::Result<T, Status>;

/// Record an error status to the structured log at the point of creation and
/// hand it back, so call sites read `Err(log_status(Status::...))`.
pub fn log_status(status: Status) -> Status {
    tracing::error!(code = status.code().name(), "{}", status);
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ok() {
        let s = Status::ok();
        assert!(s.is_ok());
        assert_eq!(s.code(), StatusCode::Ok);
        assert!(s.message().is_none());
        assert_eq!(format!("{}", s), "Ok");
    }

    #[test]
    fn test_status_with_message() {
        let s = Status::not_found("file missing");
        assert!(!s.is_ok());
        assert_eq!(s.code(), StatusCode::NotFound);
        assert_eq!(s.message(), Some("file missing"));
        assert_eq!(format!("{}", s), "NotFound: file missing");
    }

    #[test]
    fn test_status_not_built_with() {
        let s = Status::not_built_with(Filesystem::S3);
        assert_eq!(s.code(), StatusCode::NotBuiltWith);
        assert!(s.message().unwrap().contains("S3"));
    }

    #[test]
    fn test_status_is_error() {
        let s = Status::vfs_error("disk on fire");
        let e: &dyn std::error::Error = &s;
        assert!(e.to_string().contains("disk on fire"));
    }

    #[test]
    fn test_result_alias() {
        let r: Result<u64> = Err(Status::invalid_argument("bad offset"));
        assert_eq!(r.unwrap_err().code(), StatusCode::InvalidArgument);
    }
}
