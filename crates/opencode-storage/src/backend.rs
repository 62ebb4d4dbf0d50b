use opencode_types::StorageKey;
use serde_json::Value;

use crate::Result;

/// Storage implementation behind the facade.
///
/// Backends operate on raw JSON values; typed (de)serialization and the
/// absent-key-to-`NotFound` translation happen in [`crate::Storage`].
pub trait Backend: Send + Sync {
    /// Fetch one value. `Ok(None)` when the key was never written.
    fn read(&self, key: &StorageKey) -> Result<Option<Value>>;

    /// Insert or overwrite one value.
    fn write(&self, key: &StorageKey, value: &Value) -> Result<()>;

    /// Delete the key and any children below `key + "/"`. Silent if absent.
    fn remove(&self, key: &StorageKey) -> Result<()>;

    /// Full keys strictly below `prefix`. Session prefixes come back ordered
    /// by recency (most recently updated first), everything else by key.
    fn list(&self, prefix: &StorageKey) -> Result<Vec<StorageKey>>;
}
