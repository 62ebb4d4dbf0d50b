// Hierarchical key-value storage for the opencode core.
// Facade + backends; callers go through `Storage`, backends stay swappable.

mod backend;
mod error;
mod json;
pub mod lock;
mod migrate;
mod sqlite;
mod store;

pub use backend::Backend;
pub use error::{Error, Result};
pub use json::JsonBackend;
pub use migrate::{default_legacy_root, legacy_project_dir_name, Migrator, MIGRATION_VERSION};
pub use sqlite::MultiSqliteBackend;
pub use store::Storage;

/// Per-project data directory name (`{project}/.opencode`).
pub const DATA_DIR: &str = ".opencode";
