use opencode_types::StorageKey;
use serde_json::Value;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::store::Storage;
use crate::{Error, Result};

/// Highest storage layout version this build knows how to produce.
pub const MIGRATION_VERSION: u32 = 2;

const SENTINEL_FILE: &str = "migration";

/// One-shot upgrades between storage layouts, gated by a sentinel file in
/// the project data root recording the applied version.
///
/// - v1: rewrite the legacy global JSON file tree
///   (`{legacy root}/project/{encoded dir}/storage/…`) into the per-project
///   layout, writing through the facade. Sessions first, then messages,
///   then parts, so part routing always finds its session.
/// - v2: extract `summary.diffs` out of session records into standalone
///   `session_diff/{sessionID}` records, leaving compact addition/deletion
///   totals behind.
pub struct Migrator<'a> {
    storage: &'a Storage,
    data_root: PathBuf,
}

impl<'a> Migrator<'a> {
    pub fn new(storage: &'a Storage, data_root: impl Into<PathBuf>) -> Self {
        Self {
            storage,
            data_root: data_root.into(),
        }
    }

    /// Apply every outstanding migration for one project. Idempotent.
    pub fn run(&self, legacy_root: &Path, worktree: &Path, project_id: &str) -> Result<()> {
        let applied = self.applied_version();
        if applied >= MIGRATION_VERSION {
            return Ok(());
        }

        if applied < 1 {
            self.migrate_file_tree(legacy_root, worktree, project_id)?;
        }
        if applied < 2 {
            self.extract_session_diffs(project_id)?;
        }

        self.record_version(MIGRATION_VERSION)?;
        tracing::info!(project_id, version = MIGRATION_VERSION, "storage migrated");
        Ok(())
    }

    fn sentinel_path(&self) -> PathBuf {
        self.data_root.join(SENTINEL_FILE)
    }

    fn applied_version(&self) -> u32 {
        std::fs::read_to_string(self.sentinel_path())
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0)
    }

    fn record_version(&self, version: u32) -> Result<()> {
        std::fs::create_dir_all(&self.data_root)?;
        std::fs::write(self.sentinel_path(), version.to_string())?;
        Ok(())
    }

    /// v1: legacy file tree into the current backend.
    fn migrate_file_tree(
        &self,
        legacy_root: &Path,
        worktree: &Path,
        project_id: &str,
    ) -> Result<()> {
        let legacy_storage = legacy_root
            .join("project")
            .join(legacy_project_dir_name(worktree))
            .join("storage");
        if !legacy_storage.is_dir() {
            return Ok(());
        }

        // Messages must land before their parts for the routing map.
        for record_type in ["session", "message", "part"] {
            let type_dir = legacy_storage.join(record_type);
            if !type_dir.is_dir() {
                continue;
            }

            let mut files: Vec<PathBuf> = WalkDir::new(&type_dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.file_type().is_file()
                        && e.path().extension().is_some_and(|ext| ext == "json")
                })
                .map(|e| e.into_path())
                .collect();
            files.sort();

            for file in files {
                match self.migrate_file(&legacy_storage, &file, record_type, project_id) {
                    Ok(key) => tracing::debug!(key = %key, "migrated record"),
                    Err(err) => {
                        tracing::warn!(
                            file = %file.display(),
                            error = %err,
                            "skipping unreadable legacy record"
                        );
                    }
                }
            }
        }

        Ok(())
    }

    fn migrate_file(
        &self,
        legacy_storage: &Path,
        file: &Path,
        record_type: &str,
        project_id: &str,
    ) -> Result<StorageKey> {
        let relative = file
            .strip_prefix(legacy_storage)
            .map_err(|_| Error::Migration(format!("file outside tree: {}", file.display())))?
            .with_extension("");
        let segments: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();

        let raw = std::fs::read_to_string(file)?;
        let mut value: Value = serde_json::from_str(&raw)?;

        // Legacy session keys carried no project segment; insert the one
        // inferred from the repository.
        let key = if record_type == "session" {
            let session_id = segments
                .last()
                .ok_or_else(|| Error::Migration(format!("bad legacy key: {}", file.display())))?;
            if let Some(object) = value.as_object_mut() {
                object.insert("projectID".into(), Value::String(project_id.to_string()));
            }
            StorageKey::session(project_id, session_id)?
        } else {
            StorageKey::new(segments)?
        };

        self.storage.write(&key, &value)?;
        Ok(key)
    }

    /// v2: pull `summary.diffs` out of each session record.
    fn extract_session_diffs(&self, project_id: &str) -> Result<()> {
        let prefix = StorageKey::new(["session", project_id])?;
        for key in self.storage.list(&prefix)? {
            let Some(mut value) = self.storage.read_optional::<Value>(&key)? else {
                continue;
            };
            let Some(diffs) = value
                .get("summary")
                .and_then(|summary| summary.get("diffs"))
                .cloned()
            else {
                continue;
            };

            let files = diffs.as_array().cloned().unwrap_or_default();
            let additions: i64 = files
                .iter()
                .filter_map(|f| f.get("additions").and_then(Value::as_i64))
                .sum();
            let deletions: i64 = files
                .iter()
                .filter_map(|f| f.get("deletions").and_then(Value::as_i64))
                .sum();

            let diff_key = StorageKey::session_diff(key.leaf())?;
            self.storage
                .write(&diff_key, &serde_json::json!({ "files": files }))?;

            if let Some(object) = value.as_object_mut() {
                object.insert(
                    "summary".into(),
                    serde_json::json!({ "additions": additions, "deletions": deletions }),
                );
            }
            self.storage.write(&key, &value)?;
        }

        Ok(())
    }
}

/// Directory name the legacy layout used for a worktree: the absolute path
/// with `/` and `.` flattened to `-`.
pub fn legacy_project_dir_name(worktree: &Path) -> String {
    let encoded = worktree
        .to_string_lossy()
        .replace(['/', '.'], "-")
        .trim_start_matches('-')
        .to_string();
    format!("-{}", encoded)
}

/// `~/.local/share/opencode` (or the platform equivalent), overridable via
/// `OPENCODE_DATA_PATH`.
pub fn default_legacy_root() -> PathBuf {
    if let Ok(env_path) = std::env::var("OPENCODE_DATA_PATH") {
        return PathBuf::from(env_path);
    }

    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("opencode");
    }

    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".local/share/opencode");
    }

    PathBuf::from(".opencode-data")
}
