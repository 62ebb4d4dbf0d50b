use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Creation/initialization timestamps in unix milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
}

/// Compact per-session change counts kept on the session record itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub additions: i64,
    pub deletions: i64,
}

/// Session record stored under `session/{project_id}/{session_id}`.
///
/// Callers attach arbitrary fields (title, share state, revert markers);
/// everything this layer does not model round-trips through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(rename = "projectID")]
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub time: SessionTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SessionSummary>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-file change counts backing a session summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub file: String,
    pub additions: i64,
    pub deletions: i64,
}

/// Standalone diff record stored under `session_diff/{session_id}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDiff {
    #[serde(default)]
    pub files: Vec<FileDiff>,
}
