use std::fmt;
use std::path::PathBuf;

/// Result type for opencode-runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the runtime layer
#[derive(Debug)]
pub enum Error {
    /// State access after the instance scope was disposed
    ScopeDisposed,

    /// A sleep was cancelled before its timer fired
    Aborted,

    /// A config file failed JSON parsing
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Merged config failed schema validation; carries the diagnostics
    InvalidConfig(String),

    /// Recognized misspelling of the config directory
    ConfigDirectoryTypo(PathBuf),

    /// Published payload does not match the event's declared schema
    InvalidEvent { name: String, reason: String },

    /// Raw publish for an event name nothing has declared
    UnknownEvent(String),

    /// Storage layer error
    Storage(opencode_storage::Error),

    /// IO operation failed
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ScopeDisposed => write!(f, "Instance scope already disposed"),
            Error::Aborted => write!(f, "Sleep aborted"),
            Error::Json { path, source } => {
                write!(f, "JSON error in {}: {}", path.display(), source)
            }
            Error::InvalidConfig(diagnostics) => {
                write!(f, "Invalid config: {}", diagnostics)
            }
            Error::ConfigDirectoryTypo(path) => write!(
                f,
                "Config directory appears misspelled: {} (expected .opencode)",
                path.display()
            ),
            Error::InvalidEvent { name, reason } => {
                write!(f, "Invalid payload for event {}: {}", name, reason)
            }
            Error::UnknownEvent(name) => write!(f, "Unknown event: {}", name),
            Error::Storage(err) => write!(f, "Storage error: {}", err),
            Error::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Json { source, .. } => Some(source),
            Error::Storage(err) => Some(err),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<opencode_storage::Error> for Error {
    fn from(err: opencode_storage::Error) -> Self {
        Error::Storage(err)
    }
}

impl From<opencode_types::Error> for Error {
    fn from(err: opencode_types::Error) -> Self {
        Error::Storage(opencode_storage::Error::Key(err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}
