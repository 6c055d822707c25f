use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error classes reported by the device, derived from the exception name and
/// errno on the last line of a traceback.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    #[error("No such file or directory")]
    NotFound,
    #[error("File exists")]
    AlreadyExists,
    #[error("Is a directory")]
    IsADirectory,
    #[error("Not a directory")]
    NotADirectory,
    #[error("Directory not empty")]
    NotEmpty,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("No space left on device")]
    NoSpace,
    #[error("Remote failure")]
    Other,
}

impl RemoteErrorKind {
    pub(crate) fn from_errno(errno: u32) -> Self {
        match errno {
            2 => Self::NotFound,
            13 => Self::PermissionDenied,
            17 => Self::AlreadyExists,
            20 => Self::NotADirectory,
            21 => Self::IsADirectory,
            28 => Self::NoSpace,
            39 => Self::NotEmpty,
            _ => Self::Other,
        }
    }

    pub(crate) fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "ENOENT" => Self::NotFound,
            "EACCES" | "EPERM" => Self::PermissionDenied,
            "EEXIST" => Self::AlreadyExists,
            "ENOTDIR" => Self::NotADirectory,
            "EISDIR" => Self::IsADirectory,
            "ENOSPC" => Self::NoSpace,
            "ENOTEMPTY" => Self::NotEmpty,
            _ => return None,
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Remote path operation attempted without an active board connection.
    #[error("no board connected")]
    NotConnected,
    /// Transport failure; the connection must be re-established before reuse.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The response sentinel did not arrive within the timeout. The channel
    /// may hold partial output and should be treated as untrustworthy.
    #[error("board unresponsive")]
    Unresponsive,
    /// The response could not be parsed. Fatal to the single call only.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A named failure reported by the device, or the same condition raised
    /// host-side by the operation engine.
    #[error("'{path}': {kind}")]
    Remote {
        kind: RemoteErrorKind,
        path: String,
        detail: String,
    },
    /// Any errors related to local I/O
    #[error("I/O: {0}")]
    Io(String),
    /// Ambiguous multi-source copy/move into a non-directory, or a
    /// destination nested inside a source.
    #[error("invalid destination: {0}")]
    InvalidDestination(String),
    /// Local-only feature invoked on a remote path.
    #[error("operation not supported on remote paths: {0}")]
    Unsupported(&'static str),
    #[error("bad pattern: {0}")]
    Pattern(String),
}

impl Error {
    pub(crate) fn remote(kind: RemoteErrorKind, detail: impl Into<String>) -> Self {
        Self::Remote {
            kind,
            path: String::new(),
            detail: detail.into(),
        }
    }

    /// Attach the path an operation was acting on, so failures surfaced to
    /// the caller always name the file involved.
    pub(crate) fn at(self, path: &str) -> Self {
        match self {
            Self::Remote {
                kind,
                detail,
                path: old,
            } if old.is_empty() => Self::Remote {
                kind,
                path: path.to_string(),
                detail,
            },
            Self::Io(detail) => Self::Io(format!("'{path}': {detail}")),
            other => other,
        }
    }

    /// The device-reported error class, if this is a remote failure.
    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            Self::Remote { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.remote_kind() == Some(RemoteErrorKind::NotFound)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => RemoteErrorKind::NotFound,
            io::ErrorKind::AlreadyExists => RemoteErrorKind::AlreadyExists,
            io::ErrorKind::PermissionDenied => RemoteErrorKind::PermissionDenied,
            _ => return Self::Io(err.to_string()),
        };
        Self::remote(kind, err.to_string())
    }
}

impl From<glob::PatternError> for Error {
    fn from(err: glob::PatternError) -> Self {
        Self::Pattern(err.to_string())
    }
}
