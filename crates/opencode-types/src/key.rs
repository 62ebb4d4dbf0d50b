use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Record class identified by a key's first segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Session,
    SessionDiff,
    Message,
    Part,
    Project,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Session => "session",
            RecordType::SessionDiff => "session_diff",
            RecordType::Message => "message",
            RecordType::Part => "part",
            RecordType::Project => "project",
        }
    }

    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "session" => Some(RecordType::Session),
            "session_diff" => Some(RecordType::SessionDiff),
            "message" => Some(RecordType::Message),
            "part" => Some(RecordType::Part),
            "project" => Some(RecordType::Project),
            _ => None,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Hierarchical storage key: an ordered sequence of URL-safe segments.
///
/// The first segment names the record type (`session`, `message`, `part`,
/// `session_diff`, `project`). Segments are case-sensitive, never empty and
/// never contain `/`; the string form is `segments.join("/")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageKey(Vec<String>);

impl StorageKey {
    /// Build a key from pre-split segments, validating each one.
    pub fn new<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(Error::InvalidKey("key must have at least one segment".into()));
        }
        for segment in &segments {
            if segment.is_empty() {
                return Err(Error::InvalidKey("empty segment".into()));
            }
            if segment.contains('/') {
                return Err(Error::InvalidKey(format!("segment contains '/': {}", segment)));
            }
        }
        Ok(Self(segments))
    }

    /// Parse the `a/b/c` string form.
    pub fn parse(key: &str) -> Result<Self> {
        Self::new(key.split('/'))
    }

    /// Key for a session record: `session/{project_id}/{session_id}`.
    pub fn session(project_id: &str, session_id: &str) -> Result<Self> {
        Self::new(["session", project_id, session_id])
    }

    /// Key for a session diff record: `session_diff/{session_id}`.
    pub fn session_diff(session_id: &str) -> Result<Self> {
        Self::new(["session_diff", session_id])
    }

    /// Key for a message record: `message/{session_id}/{message_id}`.
    pub fn message(session_id: &str, message_id: &str) -> Result<Self> {
        Self::new(["message", session_id, message_id])
    }

    /// Key for a part record: `part/{message_id}/{part_id}`.
    pub fn part(message_id: &str, part_id: &str) -> Result<Self> {
        Self::new(["part", message_id, part_id])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First segment, classified. `None` for keys outside the known types.
    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::from_segment(&self.0[0])
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    /// Last segment (the record's own id).
    pub fn leaf(&self) -> &str {
        self.0.last().expect("keys are non-empty")
    }

    /// Extend with one more segment.
    pub fn child(&self, segment: &str) -> Result<Self> {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Self::new(segments)
    }

    /// True when `self` equals `prefix` or sits below it in the hierarchy.
    pub fn starts_with(&self, prefix: &StorageKey) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl TryFrom<String> for StorageKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<StorageKey> for String {
    fn from(key: StorageKey) -> Self {
        key.to_string()
    }
}
