use opencode_types::StorageKey;
use std::fmt;

/// Result type for opencode-storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the storage layer
#[derive(Debug)]
pub enum Error {
    /// Key absent on read/update
    NotFound(StorageKey),

    /// Part operation before its message was written in this process
    SessionUnknown(String),

    /// Database operation failed
    Database(rusqlite::Error),

    /// Payload failed JSON (de)serialization
    Json(serde_json::Error),

    /// IO operation failed
    Io(std::io::Error),

    /// Key failed structural validation
    Key(opencode_types::Error),

    /// Migration could not be applied
    Migration(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(key) => write!(f, "Not found: {}", key),
            Error::SessionUnknown(message_id) => {
                write!(f, "No session known for message: {}", message_id)
            }
            Error::Database(err) => write!(f, "Database error: {}", err),
            Error::Json(err) => write!(f, "JSON error: {}", err),
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::Key(err) => write!(f, "{}", err),
            Error::Migration(msg) => write!(f, "Migration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(err) => Some(err),
            Error::Json(err) => Some(err),
            Error::Io(err) => Some(err),
            Error::Key(err) => Some(err),
            Error::NotFound(_) | Error::SessionUnknown(_) | Error::Migration(_) => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<opencode_types::Error> for Error {
    fn from(err: opencode_types::Error) -> Self {
        Error::Key(err)
    }
}
