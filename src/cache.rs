use crate::error::BoxError;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// String-to-string map persisted as one JSON object.
///
/// Every lookup re-reads the file and every insert rewrites it, so two
/// processes sharing a file can lose each other's writes.
#[derive(Debug, Clone)]
pub struct JsonCache {
    path: PathBuf,
}

impl JsonCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or unreadable file is an empty cache.
    fn load(&self) -> BTreeMap<String, String> {
        let Ok(content) = fs::read_to_string(&self.path) else {
            return BTreeMap::new();
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "Ignoring corrupt cache file");
            BTreeMap::new()
        })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.load().remove(key)
    }

    pub fn insert(&self, key: &str, value: &str) -> Result<(), BoxError> {
        let mut entries = self.load();
        entries.insert(key.to_string(), value.to_string());
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&entries)?)?;
        Ok(())
    }
}
