use anyhow::{anyhow, Result};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::warn;

use crate::wire::CourseIndex;

const COURSE_LIST_KEY: &str = "course_list";
const MAX_SUGGESTIONS: usize = 5;

/// Small string key-value store for client-local state.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
}

#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: HashMap<String, String>,
}

#[cfg(test)]
impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Persists the whole map as one pretty-printed JSON object.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStore { path: path.into() }
    }

    /// `<local data dir>/notes-client/state.json`
    pub fn default_location() -> Result<Self> {
        let dir = dirs::data_local_dir().ok_or_else(|| anyhow!("could not find local data dir"))?;
        Ok(Self::new(dir.join("notes-client").join("state.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let raw = fs::read(&self.path)?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load()?.remove(key))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut values = self.load().unwrap_or_else(|e| {
            warn!("discarding unreadable state file {:?}: {}", self.path, e);
            HashMap::new()
        });
        values.insert(key.to_string(), value.to_string());

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(&values)?)?;
        Ok(())
    }
}

/// Known course names, refreshed from every successful listing and used only
/// to suggest input. May be stale.
pub struct CourseCache<S: KeyValueStore> {
    store: S,
}

impl<S: KeyValueStore> CourseCache<S> {
    pub fn new(store: S) -> Self {
        CourseCache { store }
    }

    pub fn remember(&mut self, index: &CourseIndex) -> Result<()> {
        let names: Vec<&String> = index.keys().collect();
        self.store
            .set(COURSE_LIST_KEY, &serde_json::to_string(&names)?)
    }

    pub fn courses(&self) -> Vec<String> {
        let raw = match self.store.get(COURSE_LIST_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("course cache unavailable: {}", e);
                return Vec::new();
            }
        };

        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("course cache is corrupt, ignoring: {}", e);
            Vec::new()
        })
    }

    /// Up to five cached names containing `typed`, case-insensitively.
    pub fn suggest(&self, typed: &str) -> Vec<String> {
        let needle = typed.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }

        self.courses()
            .into_iter()
            .filter(|c| c.to_lowercase().contains(&needle))
            .take(MAX_SUGGESTIONS)
            .collect()
    }
}
