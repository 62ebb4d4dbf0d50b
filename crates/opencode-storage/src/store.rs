use opencode_types::StorageKey;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::backend::Backend;
use crate::{Error, Result};

/// Facade over a [`Backend`]: five operations on hierarchical keys with
/// typed payloads.
///
/// `update` is read-modify-write at the level of a single key; it holds no
/// cross-key lock. Callers needing multi-key atomicity coordinate outside
/// this layer.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn Backend>,
}

impl Storage {
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Read and parse the value at `key`. `NotFound` when absent.
    pub fn read<T: DeserializeOwned>(&self, key: &StorageKey) -> Result<T> {
        match self.backend.read(key)? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Err(Error::NotFound(key.clone())),
        }
    }

    /// `Option`-returning sibling of [`Storage::read`] for records that may
    /// legitimately not exist yet.
    pub fn read_optional<T: DeserializeOwned>(&self, key: &StorageKey) -> Result<Option<T>> {
        match self.backend.read(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn write<T: Serialize>(&self, key: &StorageKey, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        tracing::debug!(key = %key, "storage write");
        self.backend.write(key, &value)
    }

    /// Apply `mutate` to the parsed value and write the result back.
    /// Returns the new value. `NotFound` when the key was never written.
    pub fn update<T, F>(&self, key: &StorageKey, mutate: F) -> Result<T>
    where
        T: DeserializeOwned + Serialize,
        F: FnOnce(&mut T),
    {
        let mut value: T = self.read(key)?;
        mutate(&mut value);
        self.write(key, &value)?;
        Ok(value)
    }

    /// Delete `key` and everything below it. Silent if absent.
    pub fn remove(&self, key: &StorageKey) -> Result<()> {
        tracing::debug!(key = %key, "storage remove");
        self.backend.remove(key)
    }

    /// Full keys strictly below `prefix`; empty when nothing matches.
    pub fn list(&self, prefix: &StorageKey) -> Result<Vec<StorageKey>> {
        self.backend.list(prefix)
    }
}
