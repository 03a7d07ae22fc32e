//! Guest information kept in a JSON file.
//!
//! The file holds one object of keys to values. Values are normally strings;
//! numbers and booleans written by hand are read as their JSON text, so
//! `"tty": true` and `"tty": "true"` mean the same thing. Writes are buffered
//! until [`DataSink::flush`], which replaces the file atomically.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use tracing::debug;
use vigil_executor::{DataSink, DataSource, ExecutorError};

use crate::GuestError;

type Entries = BTreeMap<String, String>;

pub struct FileStore {
    path: PathBuf,
    entries: RwLock<Entries>,
    dirty: AtomicBool,
}

impl FileStore {
    /// Load `path`. A missing file is an empty store; it is created on the
    /// first flush.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, GuestError> {
        let path = path.into();
        let entries = load(&path)?;
        debug!("loaded {} keys from {:?}", entries.len(), path);
        Ok(Self {
            path,
            entries: RwLock::new(entries),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pick up changes made to the file by someone else. Pending writes are
    /// flushed first so they survive.
    pub fn refresh(&self) -> Result<(), GuestError> {
        self.persist()?;
        let entries = load(&self.path)?;
        *self.write() = entries;
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self) -> Result<(), GuestError> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let body = {
            let entries = self.read();
            serde_json::to_vec_pretty(&*entries).map_err(|source| GuestError::Store {
                path: self.path.clone(),
                source,
            })?
        };
        let tmp = self.path.with_extension("tmp");
        let result = fs::write(&tmp, body).and_then(|_| fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            self.dirty.store(true, Ordering::Release);
            return Err(e.into());
        }
        debug!("wrote {:?}", self.path);
        Ok(())
    }
}

fn load(path: &Path) -> Result<Entries, GuestError> {
    let body = match fs::read(path) {
        Ok(body) => body,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Entries::new()),
        Err(e) => return Err(e.into()),
    };
    let object: BTreeMap<String, Value> = serde_json::from_slice(&body).map_err(|source| GuestError::Store {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(object
        .into_iter()
        .filter_map(|(key, value)| match value {
            Value::String(s) => Some((key, s)),
            Value::Null => None,
            other => Some((key, other.to_string())),
        })
        .collect())
}

impl DataSource for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.read().get(key).cloned()
    }

    fn keys(&self, prefix: &str) -> Vec<String> {
        self.read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

impl DataSink for FileStore {
    fn set(&self, key: &str, value: &str) -> Result<(), ExecutorError> {
        let mut entries = self.write();
        if entries.get(key).map(String::as_str) != Some(value) {
            entries.insert(key.to_string(), value.to_string());
            self.dirty.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), ExecutorError> {
        self.persist().map_err(|e| match e {
            GuestError::Io(e) => ExecutorError::Io(e),
            other => ExecutorError::Platform(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("guestinfo.json");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("absent.json")).unwrap();
        assert_eq!(store.get("common/id"), None);
        assert!(store.keys("").is_empty());
    }

    #[test]
    fn test_non_string_values_read_as_json_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{"common/id": "abc", "sessions/abc/tty": true, "common/diagnostics/debug": 2, "gone": null}"#,
        );
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get("common/id").as_deref(), Some("abc"));
        assert_eq!(store.get("sessions/abc/tty").as_deref(), Some("true"));
        assert_eq!(store.get("common/diagnostics/debug").as_deref(), Some("2"));
        assert_eq!(store.get("gone"), None);
    }

    #[test]
    fn test_keys_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{"sessions/a/cmd/path": "/bin/true", "sessions/b/cmd/path": "/bin/false", "sessionsx": "1"}"#,
        );
        let store = FileStore::open(&path).unwrap();
        assert_eq!(
            store.keys("sessions/"),
            vec!["sessions/a/cmd/path".to_string(), "sessions/b/cmd/path".to_string()]
        );
    }

    #[test]
    fn test_flush_writes_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), r#"{"common/id": "abc"}"#);
        let store = FileStore::open(&path).unwrap();
        store.set("sessions/abc/started", "true").unwrap();
        store.flush().unwrap();

        assert!(!path.with_extension("tmp").exists());
        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get("common/id").as_deref(), Some("abc"));
        assert_eq!(reopened.get("sessions/abc/started").as_deref(), Some("true"));
    }

    #[test]
    fn test_flush_without_changes_leaves_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let body = r#"{"common/id":"abc"}"#;
        let path = write_config(dir.path(), body);
        let store = FileStore::open(&path).unwrap();
        store.set("common/id", "abc").unwrap();
        store.flush().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), body);
    }

    #[test]
    fn test_refresh_keeps_pending_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), r#"{"common/id": "abc"}"#);
        let store = FileStore::open(&path).unwrap();
        store.set("sessions/abc/status", "0").unwrap();

        store.refresh().unwrap();
        assert_eq!(store.get("sessions/abc/status").as_deref(), Some("0"));

        let mut edited: BTreeMap<String, String> = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        edited.insert("common/name".into(), "web".into());
        fs::write(&path, serde_json::to_vec(&edited).unwrap()).unwrap();

        store.refresh().unwrap();
        assert_eq!(store.get("common/name").as_deref(), Some("web"));
        assert_eq!(store.get("sessions/abc/status").as_deref(), Some("0"));
    }

    #[test]
    fn test_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "not json");
        match FileStore::open(&path) {
            Err(GuestError::Store { path: p, .. }) => assert_eq!(p, path),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("parsed garbage"),
        }
    }
}
