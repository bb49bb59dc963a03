use std::{
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::config::DeviceConfig;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend unavailable")]
    Unavailable,
    #[error("failed to encode config: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("storage write failed: {0}")]
    Io(#[from] io::Error),
}

/// How `load` arrived at the record it returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Parsed from the stored record.
    Stored,
    /// No record present; defaults returned.
    Missing,
    /// Record present but unreadable or unparsable; defaults returned.
    Corrupt,
    /// Backing storage would not mount; defaults returned.
    Unavailable,
}

/// Durable byte storage for the single config record.
pub trait Storage {
    /// Mounts the backing filesystem. Must be idempotent.
    fn mount(&mut self) -> bool;

    /// Reads the record; `Ok(None)` means no record exists.
    fn read(&mut self) -> io::Result<Option<Vec<u8>>>;

    /// Replaces the record, all-or-nothing.
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn erase(&mut self) -> io::Result<()>;
}

/// Write-through persistence for a [`DeviceConfig`] record.
pub struct ConfigStore<S> {
    storage: S,
    mounted: Option<bool>,
}

impl<S: Storage> ConfigStore<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            mounted: None,
        }
    }

    // Mount happens lazily on first access; the result is cached so a
    // failed mount is not retried mid-sequence.
    fn ensure_mounted(&mut self) -> bool {
        match self.mounted {
            Some(ok) => ok,
            None => {
                let ok = self.storage.mount();
                self.mounted = Some(ok);
                ok
            }
        }
    }

    /// Loads the record, falling back to defaults on every failure path.
    pub fn load<C: DeviceConfig>(&mut self) -> (C, LoadOutcome) {
        if !self.ensure_mounted() {
            return (C::default(), LoadOutcome::Unavailable);
        }

        let raw = match self.storage.read() {
            Ok(Some(raw)) => raw,
            Ok(None) => return (C::default(), LoadOutcome::Missing),
            Err(_) => return (C::default(), LoadOutcome::Corrupt),
        };

        match serde_json::from_slice::<C>(&raw) {
            Ok(mut config) => {
                config.sanitize();
                (config, LoadOutcome::Stored)
            }
            Err(_) => (C::default(), LoadOutcome::Corrupt),
        }
    }

    pub fn save<C: DeviceConfig>(&mut self, config: &C) -> Result<(), StoreError> {
        if !self.ensure_mounted() {
            return Err(StoreError::Unavailable);
        }
        let payload = serde_json::to_vec_pretty(config)?;
        self.storage.write(&payload)?;
        Ok(())
    }

    pub fn erase(&mut self) -> Result<(), StoreError> {
        if !self.ensure_mounted() {
            return Err(StoreError::Unavailable);
        }
        self.storage.erase()?;
        Ok(())
    }
}

/// File-backed storage at a fixed path.
pub struct FsStorage {
    path: PathBuf,
}

impl FsStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for FsStorage {
    fn mount(&mut self) -> bool {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent).is_ok(),
            _ => true,
        }
    }

    fn read(&mut self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        // Write-then-rename so an interrupted write leaves the previous
        // record intact instead of a half-written one.
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, bytes)?;
        fs::rename(&staging, &self.path)
    }

    fn erase(&mut self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Volatile backend for exercising the store without a filesystem.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryStorage {
    pub contents: Option<Vec<u8>>,
    pub fail_mount: bool,
    pub fail_writes: bool,
    pub mount_calls: usize,
}

#[cfg(test)]
impl Storage for MemoryStorage {
    fn mount(&mut self) -> bool {
        self.mount_calls += 1;
        !self.fail_mount
    }

    fn read(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.contents.clone())
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "write failure injected"));
        }
        self.contents = Some(bytes.to_vec());
        Ok(())
    }

    fn erase(&mut self) -> io::Result<()> {
        self.contents = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::{ThingsBoardConfig, WebThingConfig};

    fn scratch_dir(test: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("relay-common-tests")
            .join(format!("{}-{}", test, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn save_then_load_round_trips() {
        let mut store = ConfigStore::new(MemoryStorage::default());
        let config = WebThingConfig {
            thing_id: "dev-42".to_string(),
            thing_name: "Porch Relay".to_string(),
        };

        store.save(&config).unwrap();
        let (loaded, outcome) = store.load::<WebThingConfig>();

        assert_eq!(outcome, LoadOutcome::Stored);
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_record_yields_defaults() {
        let mut store = ConfigStore::new(MemoryStorage::default());
        let (loaded, outcome) = store.load::<ThingsBoardConfig>();

        assert_eq!(outcome, LoadOutcome::Missing);
        assert_eq!(loaded, ThingsBoardConfig::default());
    }

    #[test]
    fn corrupt_record_yields_defaults_without_rewriting() {
        let mut storage = MemoryStorage::default();
        storage.contents = Some(b"{not json".to_vec());
        let mut store = ConfigStore::new(storage);

        let (loaded, outcome) = store.load::<WebThingConfig>();

        assert_eq!(outcome, LoadOutcome::Corrupt);
        assert_eq!(loaded, WebThingConfig::default());
        // Defaults are not written back automatically.
        assert_eq!(store.storage.contents, Some(b"{not json".to_vec()));
    }

    #[test]
    fn mount_failure_is_nonfatal_on_load_and_fatal_on_save() {
        let mut storage = MemoryStorage::default();
        storage.fail_mount = true;
        let mut store = ConfigStore::new(storage);

        let (loaded, outcome) = store.load::<WebThingConfig>();
        assert_eq!(outcome, LoadOutcome::Unavailable);
        assert_eq!(loaded, WebThingConfig::default());

        let err = store.save(&loaded).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable));
    }

    #[test]
    fn mount_is_attempted_once_across_accesses() {
        let mut store = ConfigStore::new(MemoryStorage::default());

        let _ = store.load::<WebThingConfig>();
        store.save(&WebThingConfig::default()).unwrap();
        let _ = store.load::<WebThingConfig>();

        assert_eq!(store.storage.mount_calls, 1);
    }

    #[test]
    fn oversized_stored_values_are_bounded_on_load() {
        let mut storage = MemoryStorage::default();
        storage.contents = Some(
            serde_json::to_vec(&serde_json::json!({
                "thing_id": "i".repeat(80),
                "thing_name": "n".repeat(80),
            }))
            .unwrap(),
        );
        let mut store = ConfigStore::new(storage);

        let (loaded, outcome) = store.load::<WebThingConfig>();

        assert_eq!(outcome, LoadOutcome::Stored);
        assert_eq!(loaded.thing_id.len(), crate::config::THING_ID_MAX);
        assert_eq!(loaded.thing_name.len(), crate::config::THING_NAME_MAX);
    }

    #[test]
    fn fs_round_trip_and_staging_cleanup() {
        let dir = scratch_dir("fs-round-trip");
        let path = dir.join("config.json");
        let mut store = ConfigStore::new(FsStorage::new(&path));
        let config = ThingsBoardConfig {
            server: "tb.example.net:8883".to_string(),
            token: "token-123".to_string(),
        };

        store.save(&config).unwrap();
        let (loaded, outcome) = store.load::<ThingsBoardConfig>();

        assert_eq!(outcome, LoadOutcome::Stored);
        assert_eq!(loaded, config);
        assert!(!path.with_extension("tmp").exists());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn fs_save_replaces_corrupt_record_atomically() {
        let dir = scratch_dir("fs-replace");
        let path = dir.join("config.json");
        fs::create_dir_all(&dir).unwrap();
        fs::write(&path, b"garbage").unwrap();

        let mut store = ConfigStore::new(FsStorage::new(&path));
        let (_, outcome) = store.load::<WebThingConfig>();
        assert_eq!(outcome, LoadOutcome::Corrupt);

        let config = WebThingConfig {
            thing_id: "dev-42".to_string(),
            thing_name: "dev-42".to_string(),
        };
        store.save(&config).unwrap();

        let (reloaded, outcome) = store.load::<WebThingConfig>();
        assert_eq!(outcome, LoadOutcome::Stored);
        assert_eq!(reloaded, config);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn erase_removes_the_record() {
        let mut store = ConfigStore::new(MemoryStorage::default());
        store.save(&WebThingConfig::default()).unwrap();

        store.erase().unwrap();
        let (_, outcome) = store.load::<WebThingConfig>();

        assert_eq!(outcome, LoadOutcome::Missing);
    }
}
