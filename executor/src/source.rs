//! Key/value access to the guest-information space.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::ExecutorError;

pub trait DataSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// Every key starting with `prefix`, sorted.
    fn keys(&self, prefix: &str) -> Vec<String>;
}

pub trait DataSink: Send + Sync {
    fn set(&self, key: &str, value: &str) -> Result<(), ExecutorError>;

    /// Push buffered writes out to the backing store.
    fn flush(&self) -> Result<(), ExecutorError> {
        Ok(())
    }
}

/// In-memory store serving as both source and sink.
#[derive(Debug, Default)]
pub struct MapStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MapStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(entries: BTreeMap<String, String>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.into(), value.into());
        }
    }

    pub fn remove_prefix(&self, prefix: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|k, _| !k.starts_with(prefix));
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries.read().map(|e| e.clone()).unwrap_or_default()
    }
}

impl DataSource for MapStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().ok()?.get(key).cloned()
    }

    fn keys(&self, prefix: &str) -> Vec<String> {
        match self.entries.read() {
            Ok(entries) => entries
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl DataSink for MapStore {
    fn set(&self, key: &str, value: &str) -> Result<(), ExecutorError> {
        self.entries
            .write()
            .map_err(|_| ExecutorError::Platform("config store lock poisoned".into()))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Distinct child names directly below `prefix/`.
pub(crate) fn children(source: &dyn DataSource, prefix: &str) -> Vec<String> {
    let base = format!("{}/", prefix);
    let mut names: Vec<String> = source
        .keys(&base)
        .iter()
        .filter_map(|k| k[base.len()..].split('/').next())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_scan() {
        let store = MapStore::new();
        store.insert("sessions/a/cmd/path", "/bin/true");
        store.insert("sessions/a/tty", "false");
        store.insert("sessions/b/cmd/path", "/bin/false");
        store.insert("sessionsx/c", "nope");
        store.insert("common/id", "a");

        assert_eq!(
            store.keys("sessions/a/"),
            vec!["sessions/a/cmd/path".to_string(), "sessions/a/tty".to_string()]
        );
        assert_eq!(children(&store, "sessions"), vec!["a", "b"]);
        assert!(children(&store, "mounts").is_empty());
    }

    #[test]
    fn test_sink_writes_are_visible() {
        let store = MapStore::new();
        store.set("sessions/a/started", "true").unwrap();
        assert_eq!(store.get("sessions/a/started").as_deref(), Some("true"));
        store.remove_prefix("sessions/");
        assert!(store.get("sessions/a/started").is_none());
    }
}
