//! Process-wide settings persisted as a JSON object on disk.
//!
//! Loaded once at startup if the file exists, changed only through [`SettingsStore::set`], and
//! written back synchronously after every change.  Tool handlers run concurrently, so all access
//! goes through a mutex.
use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::*;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("Error reading settings file '{}'", path.display()))]
    ReadSettings {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Settings file '{}' does not contain a JSON object", path.display()))]
    ParseSettings {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Error serializing settings for '{}'", path.display()))]
    SerializeSettings {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Error writing settings file '{}'", path.display()))]
    WriteSettings {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Settings are unavailable after a previous update panicked"))]
    Poisoned,
}

#[derive(Clone, Debug)]
pub struct SettingsStore {
    /// Where the settings are persisted.  `None` keeps them in memory only.
    path: Option<PathBuf>,
    values: Arc<Mutex<Map<String, Value>>>,
}

impl SettingsStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: Arc::default(),
        }
    }

    /// Load the settings persisted at `path`.
    ///
    /// A missing file is not an error, it just means nothing has been saved yet.  A file that
    /// exists but can't be read or parsed is, since silently replacing it on the next update
    /// would lose whatever it held.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();

        let values = match std::fs::read(&path) {
            Ok(contents) => {
                serde_json::from_slice(&contents).context(ParseSettingsSnafu { path: &path })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No settings file yet; starting empty");
                Map::new()
            }
            Err(e) => return Err(e).context(ReadSettingsSnafu { path: &path }),
        };

        Ok(Self {
            path: Some(path),
            values: Arc::new(Mutex::new(values)),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, SettingsError> {
        Ok(self.lock()?.get(key).cloned())
    }

    /// Convenience for settings that hold a string
    pub fn get_string(&self, key: &str) -> Result<Option<String>, SettingsError> {
        Ok(self
            .get(key)?
            .and_then(|value| value.as_str().map(str::to_string)))
    }

    /// A copy of every setting
    pub fn snapshot(&self) -> Result<Map<String, Value>, SettingsError> {
        Ok(self.lock()?.clone())
    }

    /// Change one setting and persist the result before returning.  Setting a key to `null`
    /// removes it.
    ///
    /// Returns the previous value, if any.  If persisting fails the in-memory change is rolled
    /// back so memory and disk don't drift apart.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<Option<Value>, SettingsError> {
        let key = key.into();
        let mut values = self.lock()?;

        let previous = if value.is_null() {
            values.remove(&key)
        } else {
            values.insert(key.clone(), value)
        };

        if let Err(e) = self.flush(&values) {
            match &previous {
                Some(previous) => values.insert(key, previous.clone()),
                None => values.remove(&key),
            };
            return Err(e);
        }

        debug!(%key, "Setting updated");
        Ok(previous)
    }

    fn flush(&self, values: &Map<String, Value>) -> Result<(), SettingsError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context(WriteSettingsSnafu { path })?;
        }

        let contents =
            serde_json::to_vec_pretty(values).context(SerializeSettingsSnafu { path })?;
        std::fs::write(path, contents).context(WriteSettingsSnafu { path })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Map<String, Value>>, SettingsError> {
        self.values.lock().map_err(|_| SettingsError::Poisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("settings.json")).unwrap();

        assert!(store.snapshot().unwrap().is_empty());
        assert_eq!(store.get("papers_dir").unwrap(), None);
    }

    #[test]
    fn updates_are_persisted_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let store = SettingsStore::load(&path).unwrap();
        assert_eq!(store.set("papers_dir", json!("/tmp/papers")).unwrap(), None);
        assert_eq!(
            store.set("papers_dir", json!("/srv/papers")).unwrap(),
            Some(json!("/tmp/papers"))
        );
        store.set("max_results", json!(5)).unwrap();

        let reloaded = SettingsStore::load(&path).unwrap();
        assert_eq!(
            reloaded.get_string("papers_dir").unwrap().as_deref(),
            Some("/srv/papers")
        );
        assert_eq!(reloaded.get("max_results").unwrap(), Some(json!(5)));
    }

    #[test]
    fn null_removes_a_setting() {
        let store = SettingsStore::in_memory();
        store.set("token", json!("abc")).unwrap();
        assert_eq!(store.set("token", json!(null)).unwrap(), Some(json!("abc")));
        assert!(store.snapshot().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();

        assert_matches!(
            SettingsStore::load(&path),
            Err(SettingsError::ParseSettings { .. })
        );
    }

    #[test]
    fn failed_writes_are_reported_and_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().join("config");
        std::fs::create_dir(&parent).unwrap();
        let store = SettingsStore::load(parent.join("settings.json")).unwrap();

        // Where the settings directory should be there is now a plain file
        std::fs::remove_dir(&parent).unwrap();
        std::fs::write(&parent, "not a directory").unwrap();

        assert_matches!(
            store.set("papers_dir", json!("/srv/papers")),
            Err(SettingsError::WriteSettings { .. })
        );
        assert_eq!(store.get("papers_dir").unwrap(), None);
        assert_eq!(std::fs::read_to_string(&parent).unwrap(), "not a directory");
    }

    #[test]
    fn concurrent_updates_are_all_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::load(&path).unwrap();

        std::thread::scope(|scope| {
            for i in 0..8 {
                let store = store.clone();
                scope.spawn(move || store.set(format!("key{i}"), json!(i)).unwrap());
            }
        });

        let reloaded = SettingsStore::load(&path).unwrap();
        assert_eq!(reloaded.snapshot().unwrap().len(), 8);
    }
}
