use std::fmt;
use std::io;

/// Unified error type for the pieces of the system that need to branch on
/// error *kind* rather than just propagate with `?`.
#[derive(Debug)]
pub enum DirsyncError {
    /// Socket read/write failure, EOF, or deadline expiry.
    Transport(String),
    /// Unparseable frame, unknown service, or a disallowed operation for the
    /// current connection state.
    Protocol(String),
    /// Wrong credentials, duplicate live login, or user already registered.
    Auth(String),
    /// A path vanished between being observed and being acted on.
    FilesystemRace(String),
    /// sqlite prepare/bind/step failure.
    Storage(String),
    /// Content or password hashing failed.
    Hashing(String),
    Io(io::Error),
}

impl fmt::Display for DirsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirsyncError::Transport(m) => write!(f, "transport error: {m}"),
            DirsyncError::Protocol(m) => write!(f, "protocol error: {m}"),
            DirsyncError::Auth(m) => write!(f, "authentication error: {m}"),
            DirsyncError::FilesystemRace(m) => write!(f, "filesystem race: {m}"),
            DirsyncError::Storage(m) => write!(f, "storage error: {m}"),
            DirsyncError::Hashing(m) => write!(f, "hashing error: {m}"),
            DirsyncError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for DirsyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DirsyncError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DirsyncError {
    fn from(e: io::Error) -> Self {
        // A vanished file mid-operation is the one io::ErrorKind worth
        // distinguishing from a generic transport/storage failure.
        if e.kind() == io::ErrorKind::NotFound {
            DirsyncError::FilesystemRace(e.to_string())
        } else {
            DirsyncError::Io(e)
        }
    }
}

impl From<rusqlite::Error> for DirsyncError {
    fn from(e: rusqlite::Error) -> Self {
        DirsyncError::Storage(e.to_string())
    }
}

impl From<crate::codec::ParseError> for DirsyncError {
    fn from(e: crate::codec::ParseError) -> Self {
        DirsyncError::Protocol(e.to_string())
    }
}

impl DirsyncError {
    pub fn is_filesystem_race(&self) -> bool {
        matches!(self, DirsyncError::FilesystemRace(_))
    }
}
