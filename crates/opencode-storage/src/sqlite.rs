use opencode_types::{RecordType, StorageKey};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::backend::Backend;
use crate::{Error, Result};

// NOTE: Database layout rationale
//
// Why one DB per session (not one big DB)?
// - A session's transcript grows without bound; deleting a session becomes
//   a single file unlink instead of a mass DELETE + VACUUM
// - Sessions are written by exactly one conversation at a time, so the
//   single-writer-per-file model never contends across sessions
// - The metadata DB stays small and fast to scan for listings
//
// Why an in-process message -> session map?
// - Part keys carry the message id, not the session id; the map routes part
//   operations without re-reading. The application always writes a message
//   before its parts within one process, so the map is warm by construction.
//   A part touched before its message fails with SessionUnknown.

const METADATA_DB: &str = "sessions.db";
const SESSIONS_DIR: &str = "sessions";

const METADATA_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions(
    session_id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    data       TEXT NOT NULL,
    created_at INTEGER DEFAULT (unixepoch()),
    updated_at INTEGER DEFAULT (unixepoch())
);

CREATE INDEX IF NOT EXISTS idx_project_id ON sessions(project_id);
CREATE INDEX IF NOT EXISTS idx_updated_at ON sessions(updated_at DESC);

CREATE TABLE IF NOT EXISTS storage(
    key        TEXT PRIMARY KEY,
    type       TEXT NOT NULL,
    data       TEXT NOT NULL,
    created_at INTEGER DEFAULT (unixepoch()),
    updated_at INTEGER DEFAULT (unixepoch())
);

CREATE INDEX IF NOT EXISTS idx_type ON storage(type);
"#;

const SESSION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS storage(
    key        TEXT PRIMARY KEY,
    type       TEXT NOT NULL,
    data       TEXT NOT NULL,
    created_at INTEGER DEFAULT (unixepoch()),
    updated_at INTEGER DEFAULT (unixepoch())
);

CREATE INDEX IF NOT EXISTS idx_type ON storage(type);
"#;

/// Where a key's record lives after routing.
enum Placement {
    /// Row in the metadata DB `sessions` table
    SessionRow {
        project_id: String,
        session_id: String,
    },
    /// storage-shaped table in the metadata DB (`session_diff`, `project`)
    MetadataTable,
    /// `storage` table of one session's DB
    SessionTable { session_id: String },
}

/// SQLite backend with one metadata DB per project and one DB per session.
///
/// Layout under the project data root (`{project}/.opencode/`):
///
/// ```text
/// sessions.db               # session rows + storage-shaped table for
///                           # session_diff and project records
/// sessions/{sessionID}.db   # transcript records for one session
/// ```
///
/// Session DBs are opened lazily on first use and the handles are cached
/// for the life of the process.
pub struct MultiSqliteBackend {
    root: PathBuf,
    meta: Mutex<Connection>,
    sessions: Mutex<HashMap<String, Arc<Mutex<Connection>>>>,
    message_sessions: Mutex<HashMap<String, String>>,
}

impl MultiSqliteBackend {
    /// Open (or create) the per-project databases rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(SESSIONS_DIR))?;

        let meta = open_database(&root.join(METADATA_DB), METADATA_SCHEMA)?;
        tracing::debug!(root = %root.display(), "opened project storage");

        Ok(Self {
            root,
            meta: Mutex::new(meta),
            sessions: Mutex::new(HashMap::new()),
            message_sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn placement(&self, key: &StorageKey) -> Result<Placement> {
        match key.record_type() {
            Some(RecordType::Session) => {
                let (Some(project_id), Some(session_id)) = (key.get(1), key.get(2)) else {
                    return Err(invalid_key(key, "session key needs project and session segments"));
                };
                Ok(Placement::SessionRow {
                    project_id: project_id.to_string(),
                    session_id: session_id.to_string(),
                })
            }
            Some(RecordType::Message) => {
                let Some(session_id) = key.get(1) else {
                    return Err(invalid_key(key, "message key needs a session segment"));
                };
                Ok(Placement::SessionTable {
                    session_id: session_id.to_string(),
                })
            }
            Some(RecordType::Part) => {
                let Some(message_id) = key.get(1) else {
                    return Err(invalid_key(key, "part key needs a message segment"));
                };
                let session_id = self.session_for_message(message_id)?;
                Ok(Placement::SessionTable { session_id })
            }
            _ => Ok(Placement::MetadataTable),
        }
    }

    fn session_db_path(&self, session_id: &str) -> PathBuf {
        self.root.join(SESSIONS_DIR).join(format!("{}.db", session_id))
    }

    /// Fetch the cached handle for a session DB, opening it when `create`
    /// is set. Read paths pass `create = false` so that looking up a
    /// never-written session does not materialize an empty DB file.
    fn session_db(&self, session_id: &str, create: bool) -> Result<Option<Arc<Mutex<Connection>>>> {
        let mut cache = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(conn) = cache.get(session_id) {
            return Ok(Some(conn.clone()));
        }

        let path = self.session_db_path(session_id);
        if !create && !path.exists() {
            return Ok(None);
        }

        let conn = Arc::new(Mutex::new(open_database(&path, SESSION_SCHEMA)?));
        cache.insert(session_id.to_string(), conn.clone());
        Ok(Some(conn))
    }

    /// Session owning a message, learned from message writes in this process.
    fn session_for_message(&self, message_id: &str) -> Result<String> {
        let map = self
            .message_sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        map.get(message_id)
            .cloned()
            .ok_or_else(|| Error::SessionUnknown(message_id.to_string()))
    }

    fn remember_message(&self, message_id: &str, session_id: &str) {
        self.message_sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(message_id.to_string(), session_id.to_string());
    }

    fn remove_session(&self, session_id: &str) -> Result<()> {
        {
            let meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
            meta.execute(
                "DELETE FROM sessions WHERE session_id = ?1",
                params![session_id],
            )?;
        }

        // Drop the cached handle before unlinking so the file is closed.
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);

        let db_path = self.session_db_path(session_id);
        for path in [
            db_path.clone(),
            db_path.with_extension("db-wal"),
            db_path.with_extension("db-shm"),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }
}

impl Backend for MultiSqliteBackend {
    fn read(&self, key: &StorageKey) -> Result<Option<Value>> {
        match self.placement(key)? {
            Placement::SessionRow { session_id, .. } => {
                let meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
                let data: Option<String> = meta
                    .query_row(
                        "SELECT data FROM sessions WHERE session_id = ?1",
                        params![session_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                data.map(|raw| serde_json::from_str(&raw).map_err(Error::from))
                    .transpose()
            }
            Placement::MetadataTable => {
                let meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
                read_storage_row(&meta, &key.to_string())
            }
            Placement::SessionTable { session_id } => {
                let Some(conn) = self.session_db(&session_id, false)? else {
                    return Ok(None);
                };
                let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                read_storage_row(&conn, &key.to_string())
            }
        }
    }

    fn write(&self, key: &StorageKey, value: &Value) -> Result<()> {
        match self.placement(key)? {
            Placement::SessionRow {
                project_id,
                session_id,
            } => {
                let data = serde_json::to_string(value)?;
                let meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
                meta.execute(
                    r#"
                    INSERT INTO sessions (session_id, project_id, data)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(session_id) DO UPDATE SET
                        project_id = excluded.project_id,
                        data = excluded.data,
                        updated_at = unixepoch()
                    "#,
                    params![session_id, project_id, data],
                )?;
                Ok(())
            }
            Placement::MetadataTable => {
                let meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
                write_storage_row(&meta, key, value)
            }
            Placement::SessionTable { session_id } => {
                let conn = self
                    .session_db(&session_id, true)?
                    .expect("session DB is created on write");
                {
                    let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                    write_storage_row(&conn, key, value)?;
                }
                if key.record_type() == Some(RecordType::Message) {
                    if let Some(message_id) = key.get(2) {
                        self.remember_message(message_id, &session_id);
                    }
                }
                Ok(())
            }
        }
    }

    fn remove(&self, key: &StorageKey) -> Result<()> {
        match self.placement(key)? {
            Placement::SessionRow { session_id, .. } => self.remove_session(&session_id),
            Placement::MetadataTable => {
                let meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
                remove_storage_rows(&meta, &key.to_string())
            }
            Placement::SessionTable { session_id } => {
                let Some(conn) = self.session_db(&session_id, false)? else {
                    return Ok(());
                };
                let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                remove_storage_rows(&conn, &key.to_string())
            }
        }
    }

    fn list(&self, prefix: &StorageKey) -> Result<Vec<StorageKey>> {
        match prefix.record_type() {
            Some(RecordType::Session) => {
                if prefix.len() > 2 {
                    // A full session key has no children in the metadata DB.
                    return Ok(Vec::new());
                }
                let meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
                let rows: Vec<(String, String)> = match prefix.get(1) {
                    Some(project_id) => {
                        let mut stmt = meta.prepare(
                            r#"
                            SELECT project_id, session_id FROM sessions
                            WHERE project_id = ?1
                            ORDER BY updated_at DESC
                            "#,
                        )?;
                        let rows = stmt
                            .query_map(params![project_id], |row| {
                                Ok((row.get(0)?, row.get(1)?))
                            })?
                            .collect::<std::result::Result<Vec<_>, _>>()?;
                        rows
                    }
                    None => {
                        let mut stmt = meta.prepare(
                            "SELECT project_id, session_id FROM sessions ORDER BY updated_at DESC",
                        )?;
                        let rows = stmt
                            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                            .collect::<std::result::Result<Vec<_>, _>>()?;
                        rows
                    }
                };

                rows.into_iter()
                    .map(|(project_id, session_id)| {
                        StorageKey::session(&project_id, &session_id).map_err(Error::from)
                    })
                    .collect()
            }
            Some(RecordType::Message) => {
                let Some(session_id) = prefix.get(1) else {
                    return Ok(Vec::new());
                };
                let Some(conn) = self.session_db(session_id, false)? else {
                    return Ok(Vec::new());
                };
                let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                list_storage_rows(&conn, &prefix.to_string())
            }
            Some(RecordType::Part) => {
                let Some(message_id) = prefix.get(1) else {
                    return Ok(Vec::new());
                };
                let session_id = self.session_for_message(message_id)?;
                let Some(conn) = self.session_db(&session_id, false)? else {
                    return Ok(Vec::new());
                };
                let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                list_storage_rows(&conn, &prefix.to_string())
            }
            _ => {
                let meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
                list_storage_rows(&meta, &prefix.to_string())
            }
        }
    }
}

fn invalid_key(key: &StorageKey, reason: &str) -> Error {
    Error::Key(opencode_types::Error::InvalidKey(format!(
        "{}: {}",
        reason, key
    )))
}

fn open_database(path: &Path, schema: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    conn.execute_batch(schema)?;
    Ok(conn)
}

fn read_storage_row(conn: &Connection, key: &str) -> Result<Option<Value>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM storage WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    data.map(|raw| serde_json::from_str(&raw).map_err(Error::from))
        .transpose()
}

fn write_storage_row(conn: &Connection, key: &StorageKey, value: &Value) -> Result<()> {
    let record_type = key
        .record_type()
        .map(|t| t.as_str().to_string())
        .unwrap_or_else(|| key.segments()[0].clone());
    conn.execute(
        r#"
        INSERT INTO storage (key, type, data)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(key) DO UPDATE SET
            data = excluded.data,
            updated_at = unixepoch()
        "#,
        params![key.to_string(), record_type, serde_json::to_string(value)?],
    )?;
    Ok(())
}

fn remove_storage_rows(conn: &Connection, key: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM storage WHERE key = ?1 OR key LIKE ?1 || '/%'",
        params![key],
    )?;
    Ok(())
}

fn list_storage_rows(conn: &Connection, prefix: &str) -> Result<Vec<StorageKey>> {
    let mut stmt =
        conn.prepare("SELECT key FROM storage WHERE key LIKE ?1 || '/%' ORDER BY key")?;
    let keys = stmt
        .query_map(params![prefix], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    keys.iter()
        .map(|raw| StorageKey::parse(raw).map_err(Error::from))
        .collect()
}
