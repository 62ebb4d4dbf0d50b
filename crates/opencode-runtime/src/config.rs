use opencode_types::config::Info;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::bus::{Bus, BusEvent};
use crate::instance::Instance;
use crate::{Error, Result};

/// Project-level config file at the instance root.
pub const CONFIG_FILE: &str = "opencode.json";
/// Machine-local overrides, merged after the project file.
pub const LOCAL_CONFIG_FILE: &str = "opencode.local.json";

/// Misspellings of the `.opencode` data directory worth failing loudly on
/// instead of silently reading an empty config.
const TYPO_DIRS: &[&str] = &[".opencod", ".open-code", ".opencode.json"];

/// Fired after every successful [`update`], carrying the merged result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigUpdated {
    pub config: Info,
}

impl BusEvent for ConfigUpdated {
    const NAME: &'static str = "config.updated";
}

/// Merged config for the instance: global, then project, then local layer,
/// each deep-merged over the previous. Missing files are empty layers;
/// comments are tolerated in every file.
pub fn get(instance: &Instance) -> Result<Info> {
    check_directory_typos(instance.directory())?;
    merged_value(instance.directory()).and_then(validate)
}

/// Deep-merge `partial` into the project config file, write it back,
/// publish [`ConfigUpdated`] on the instance bus with the merged result,
/// then dispose the instance so the next access re-reads disk.
pub fn update(instance: &Instance, partial: &Value) -> Result<Info> {
    check_directory_typos(instance.directory())?;

    let path = instance.directory().join(CONFIG_FILE);
    let mut on_disk = load_layer(&path)?.unwrap_or(Value::Object(Map::new()));
    merge(&mut on_disk, partial);

    // Reject the write if it can no longer validate; a bad update must not
    // corrupt the file on disk. The merged result substitutes the patched
    // project layer in its usual position.
    let merged = {
        let mut all_layers = Value::Object(Map::new());
        for layer_path in layer_paths(instance.directory()) {
            if layer_path == path {
                merge(&mut all_layers, &on_disk);
            } else if let Some(value) = load_layer(&layer_path)? {
                merge(&mut all_layers, &value);
            }
        }
        validate(all_layers)?
    };

    let serialized = serde_json::to_string_pretty(&on_disk).map_err(|source| Error::Json {
        path: path.clone(),
        source,
    })?;
    std::fs::write(&path, format!("{}\n", serialized))?;

    let bus = instance.state::<Bus>()?;
    bus.publish(&ConfigUpdated {
        config: merged.clone(),
    })?;

    instance.dispose();
    Ok(merged)
}

/// `{config dir}/opencode/opencode.json`, overridable via
/// `OPENCODE_CONFIG_DIR`.
pub fn global_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("OPENCODE_CONFIG_DIR") {
        return Some(PathBuf::from(dir).join(CONFIG_FILE));
    }
    dirs::config_dir().map(|dir| dir.join("opencode").join(CONFIG_FILE))
}

/// Layer files in merge order: global, project, local.
fn layer_paths(directory: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(global) = global_config_path() {
        paths.push(global);
    }
    paths.push(directory.join(CONFIG_FILE));
    paths.push(directory.join(LOCAL_CONFIG_FILE));
    paths
}

fn merged_value(directory: &Path) -> Result<Value> {
    let mut merged = Value::Object(Map::new());
    for path in layer_paths(directory) {
        if let Some(value) = load_layer(&path)? {
            merge(&mut merged, &value);
        }
    }
    Ok(merged)
}

fn load_layer(path: &Path) -> Result<Option<Value>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let stripped = strip_comments(&raw);
    let value = serde_json::from_str(&stripped).map_err(|source| Error::Json {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(value))
}

fn validate(value: Value) -> Result<Info> {
    serde_json::from_value(value).map_err(|err| Error::InvalidConfig(err.to_string()))
}

/// Recursive object merge; non-object values (including null) overwrite.
fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, patch_value) in patch {
                match target.get_mut(key) {
                    Some(existing) => merge(existing, patch_value),
                    None => {
                        target.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn check_directory_typos(directory: &Path) -> Result<()> {
    for typo in TYPO_DIRS {
        let candidate = directory.join(typo);
        if candidate.is_dir() {
            return Err(Error::ConfigDirectoryTypo(candidate));
        }
    }
    Ok(())
}

/// Remove `//` line and `/* */` block comments, string-literal aware.
/// Comment bytes become spaces so parse error positions stay meaningful.
fn strip_comments(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let mut in_string = false;

    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            out.push(b);
            if b == b'\\' && i + 1 < bytes.len() {
                out.push(bytes[i + 1]);
                i += 2;
                continue;
            }
            if b == b'"' {
                in_string = false;
            }
            i += 1;
        } else if b == b'"' {
            in_string = true;
            out.push(b);
            i += 1;
        } else if b == b'/' && bytes.get(i + 1) == Some(&b'/') {
            while i < bytes.len() && bytes[i] != b'\n' {
                out.push(b' ');
                i += 1;
            }
        } else if b == b'/' && bytes.get(i + 1) == Some(&b'*') {
            // Unterminated block comments blank out to EOF; the JSON
            // parser reports the truncation.
            while i < bytes.len() {
                if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    out.push(b' ');
                    out.push(b' ');
                    i += 2;
                    break;
                }
                out.push(if bytes[i] == b'\n' { b'\n' } else { b' ' });
                i += 1;
            }
        } else {
            out.push(b);
            i += 1;
        }
    }

    String::from_utf8(out).unwrap_or_else(|_| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_recurses_into_objects() {
        let mut target = serde_json::json!({
            "theme": "light",
            "keybinds": {"undo": "ctrl+z", "redo": "ctrl+y"}
        });
        merge(
            &mut target,
            &serde_json::json!({"keybinds": {"redo": "ctrl+shift+z"}, "username": "io"}),
        );

        assert_eq!(target["theme"], "light");
        assert_eq!(target["keybinds"]["undo"], "ctrl+z");
        assert_eq!(target["keybinds"]["redo"], "ctrl+shift+z");
        assert_eq!(target["username"], "io");
    }

    #[test]
    fn test_merge_arrays_overwrite() {
        let mut target = serde_json::json!({"tags": [1, 2]});
        merge(&mut target, &serde_json::json!({"tags": [3]}));
        assert_eq!(target["tags"], serde_json::json!([3]));
    }

    #[test]
    fn test_strip_line_comments() {
        let raw = "{\n  // the theme\n  \"theme\": \"dark\" // trailing\n}";
        let value: Value = serde_json::from_str(&strip_comments(raw)).unwrap();
        assert_eq!(value["theme"], "dark");
    }

    #[test]
    fn test_strip_block_comments() {
        let raw = "{ /* multi\nline */ \"theme\": \"dark\" }";
        let value: Value = serde_json::from_str(&strip_comments(raw)).unwrap();
        assert_eq!(value["theme"], "dark");
    }

    #[test]
    fn test_strip_preserves_slashes_in_strings() {
        let raw = r#"{"model": "anthropic/claude", "note": "a // not a comment"}"#;
        let value: Value = serde_json::from_str(&strip_comments(raw)).unwrap();
        assert_eq!(value["model"], "anthropic/claude");
        assert_eq!(value["note"], "a // not a comment");
    }

    #[test]
    fn test_strip_handles_escaped_quotes() {
        let raw = r#"{"title": "say \"hi\" // still inside"}"#;
        let value: Value = serde_json::from_str(&strip_comments(raw)).unwrap();
        assert_eq!(value["title"], "say \"hi\" // still inside");
    }

    #[test]
    fn test_validate_reports_diagnostics() {
        let err = validate(serde_json::json!({"share": "yes please"})).unwrap_err();
        match err {
            Error::InvalidConfig(diagnostics) => {
                assert!(diagnostics.contains("share") || diagnostics.contains("variant"));
            }
            other => panic!("expected InvalidConfig, got {other}"),
        }
    }
}
