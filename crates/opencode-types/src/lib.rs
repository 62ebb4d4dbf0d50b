// Shared domain types for the opencode core.
// Keys, record envelopes and the config schema; no I/O lives here.

pub mod config;
mod error;
mod key;
mod message;
mod session;

pub use error::{Error, Result};
pub use key::{RecordType, StorageKey};
pub use message::{MessageInfo, Part};
pub use session::{FileDiff, SessionDiff, SessionInfo, SessionSummary, SessionTime};
