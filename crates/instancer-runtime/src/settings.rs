//! Settings store: persisted key/value pairs behind [`RuntimeSettings`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use instancer_common::config::RuntimeSettings;
use instancer_common::error::Result;

use crate::state_file::StateFile;

/// Persistence for runtime settings.
pub trait SettingsStore: Send + Sync {
    /// Loads every stored pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn load(&self) -> Result<BTreeMap<String, String>>;

    /// Creates or updates the given pairs, leaving others untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn store(&self, pairs: &BTreeMap<String, String>) -> Result<()>;

    /// Loads the typed settings view.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn settings(&self) -> Result<RuntimeSettings> {
        Ok(RuntimeSettings::from_pairs(&self.load()?))
    }
}

/// Settings held in process memory.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    pairs: Mutex<BTreeMap<String, String>>,
}

impl MemorySettingsStore {
    /// Creates a store pre-filled with `settings`.
    #[must_use]
    pub fn with_settings(settings: &RuntimeSettings) -> Self {
        Self {
            pairs: Mutex::new(settings.to_pairs()),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .pairs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn store(&self, pairs: &BTreeMap<String, String>) -> Result<()> {
        self.pairs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(pairs.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

/// Settings backed by a JSON object on disk.
#[derive(Debug)]
pub struct JsonSettingsStore {
    file: StateFile,
}

impl JsonSettingsStore {
    /// Opens the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            file: StateFile::open(path)?,
        })
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self) -> Result<BTreeMap<String, String>> {
        self.file.read()
    }

    fn store(&self, pairs: &BTreeMap<String, String>) -> Result<()> {
        self.file.update(|current: &mut BTreeMap<String, String>| {
            current.extend(pairs.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(())
        })?;
        tracing::info!(keys = pairs.len(), "settings saved");
        Ok(())
    }
}
