//! Data keys per data store.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use zeroize::Zeroizing;

use crate::registry::Registry;

/// A data key. Zeroed on drop and never printed.
#[derive(Clone)]
pub struct DataKey(Zeroizing<String>);

impl DataKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(Zeroizing::new(key.into()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey(<redacted>)")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyFileError {
    #[error("failed to read key file {0}: {1}")]
    Read(std::path::PathBuf, std::io::Error),
    #[error("failed to parse key file {0}: {1}")]
    Parse(std::path::PathBuf, serde_json::Error),
}

/// Data keys indexed by data-store id. Cheap to clone.
#[derive(Clone, Default)]
pub struct KeyRing {
    keys: Arc<Registry<String, DataKey>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the key for `data_store_id`, replacing any previous one.
    /// Surrounding whitespace is stripped.
    pub fn insert(&self, data_store_id: impl Into<String>, key: &str) {
        self.keys.insert(data_store_id.into(), DataKey::new(key.trim()));
    }

    pub fn get(&self, data_store_id: &str) -> Option<Arc<DataKey>> {
        self.keys.get(data_store_id)
    }

    pub fn remove(&self, data_store_id: &str) -> bool {
        self.keys.remove(data_store_id).is_some()
    }

    pub fn contains(&self, data_store_id: &str) -> bool {
        self.keys.contains_key(data_store_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Load `{ "<data-store id>": "<key>", ... }` from a JSON file.
    /// Returns the number of keys loaded.
    pub fn load_json_file(&self, path: &Path) -> Result<usize, KeyFileError> {
        let text = Zeroizing::new(
            std::fs::read_to_string(path).map_err(|e| KeyFileError::Read(path.to_path_buf(), e))?,
        );
        let entries: HashMap<String, Zeroizing<String>> = serde_json::from_str(&text)
            .map_err(|e| KeyFileError::Parse(path.to_path_buf(), e))?;
        let count = entries.len();
        for (id, key) in entries {
            self.insert(id, &key);
        }
        tracing::info!(path = %path.display(), count, "data keys loaded");
        Ok(count)
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("data_stores", &self.keys.keys())
            .finish()
    }
}
