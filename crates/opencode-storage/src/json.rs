use opencode_types::StorageKey;
use serde_json::Value;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::backend::Backend;
use crate::{lock, Result};

/// Legacy file-tree backend: one pretty-printed JSON file per key.
///
/// Kept for the migration path from the file-tree layout; every facade
/// operation works against it so the migrator can write through the facade
/// during the interim step. Each operation holds a per-path advisory lock
/// (shared for read/list, exclusive for write/remove).
pub struct JsonBackend {
    root: PathBuf,
}

impl JsonBackend {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `{root}/{segments...}.json`
    fn file_path(&self, key: &StorageKey) -> PathBuf {
        let mut path = self.root.clone();
        if let Some((leaf, parents)) = key.segments().split_last() {
            for segment in parents {
                path.push(segment);
            }
            // Append rather than set_extension: ids may contain dots.
            path.push(format!("{}.json", leaf));
        }
        path
    }

    /// Directory holding a key's children.
    fn dir_path(&self, key: &StorageKey) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.segments() {
            path.push(segment);
        }
        path
    }

    fn key_for_file(&self, path: &Path) -> Option<StorageKey> {
        let relative = path.strip_prefix(&self.root).ok()?.with_extension("");
        let segments: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        StorageKey::new(segments).ok()
    }
}

impl Backend for JsonBackend {
    fn read(&self, key: &StorageKey) -> Result<Option<Value>> {
        let path = self.file_path(key);
        lock::with_read(&path, || match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        })
    }

    fn write(&self, key: &StorageKey, value: &Value) -> Result<()> {
        let path = self.file_path(key);
        lock::with_write(&path, || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, serde_json::to_string_pretty(value)?)?;
            Ok(())
        })
    }

    fn remove(&self, key: &StorageKey) -> Result<()> {
        let path = self.file_path(key);
        lock::with_write(&path, || {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            // Children live under the extensionless directory.
            let children = self.dir_path(key);
            if children.is_dir() {
                std::fs::remove_dir_all(&children)?;
            }
            Ok(())
        })
    }

    fn list(&self, prefix: &StorageKey) -> Result<Vec<StorageKey>> {
        let dir = self.dir_path(prefix);
        lock::with_read(&dir, || {
            if !dir.is_dir() {
                return Ok(Vec::new());
            }

            let mut keys = Vec::new();
            for entry in WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file()
                    && entry.path().extension().is_some_and(|ext| ext == "json")
                {
                    if let Some(key) = self.key_for_file(entry.path()) {
                        keys.push(key);
                    }
                }
            }
            keys.sort();
            Ok(keys)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backend() -> (TempDir, JsonBackend) {
        let dir = TempDir::new().unwrap();
        let backend = JsonBackend::open(dir.path().join("storage")).unwrap();
        (dir, backend)
    }

    #[test]
    fn test_roundtrip() {
        let (_dir, backend) = backend();
        let key = StorageKey::parse("session/p1/s1").unwrap();
        let value = serde_json::json!({"id": "s1"});

        backend.write(&key, &value).unwrap();
        assert_eq!(backend.read(&key).unwrap(), Some(value));
    }

    #[test]
    fn test_read_absent() {
        let (_dir, backend) = backend();
        let key = StorageKey::parse("session/p1/missing").unwrap();
        assert_eq!(backend.read(&key).unwrap(), None);
    }

    #[test]
    fn test_remove_cascades_to_children() {
        let (_dir, backend) = backend();
        let parent = StorageKey::parse("message/s1/m1").unwrap();
        let child = StorageKey::parse("message/s1/m1/draft").unwrap();
        backend.write(&parent, &serde_json::json!(1)).unwrap();
        backend.write(&child, &serde_json::json!(2)).unwrap();

        backend.remove(&parent).unwrap();
        assert_eq!(backend.read(&parent).unwrap(), None);
        assert_eq!(backend.read(&child).unwrap(), None);
    }

    #[test]
    fn test_remove_absent_is_silent() {
        let (_dir, backend) = backend();
        backend
            .remove(&StorageKey::parse("session/p1/ghost").unwrap())
            .unwrap();
    }

    #[test]
    fn test_list_sorted() {
        let (_dir, backend) = backend();
        for id in ["s2", "s1", "s3"] {
            backend
                .write(
                    &StorageKey::parse(&format!("session/p1/{}", id)).unwrap(),
                    &serde_json::json!({"id": id}),
                )
                .unwrap();
        }

        let keys = backend
            .list(&StorageKey::parse("session/p1").unwrap())
            .unwrap();
        let leaves: Vec<_> = keys.iter().map(|k| k.leaf()).collect();
        assert_eq!(leaves, ["s1", "s2", "s3"]);
    }
}
