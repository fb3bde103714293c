//! Challenge catalog: lookup of container challenge descriptors.
//!
//! The lifecycle manager only reads descriptors. Registration exists so a
//! deployment without a separate challenge service can still be driven
//! from the command line.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use instancer_common::error::{InstancerError, Result};
use instancer_common::types::{ChallengeDescriptor, ChallengeId};

use crate::state_file::StateFile;

/// Source of challenge descriptors.
pub trait ChallengeCatalog: Send + Sync {
    /// Lists every descriptor, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read.
    fn list(&self) -> Result<Vec<ChallengeDescriptor>>;

    /// Looks up one descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`InstancerError::NotFound`] for unknown ids.
    fn get(&self, id: ChallengeId) -> Result<ChallengeDescriptor> {
        self.list()?
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| InstancerError::NotFound {
                kind: "challenge",
                id: id.to_string(),
            })
    }

    /// Registers or replaces a descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be written.
    fn register(&self, descriptor: ChallengeDescriptor) -> Result<()>;

    /// Removes a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`InstancerError::NotFound`] for unknown ids.
    fn remove(&self, id: ChallengeId) -> Result<()>;
}

fn upsert(entries: &mut Vec<ChallengeDescriptor>, descriptor: ChallengeDescriptor) {
    entries.retain(|c| c.id != descriptor.id);
    entries.push(descriptor);
    entries.sort_by_key(|c| c.id);
}

fn take(entries: &mut Vec<ChallengeDescriptor>, id: ChallengeId) -> Result<()> {
    let before = entries.len();
    entries.retain(|c| c.id != id);
    if entries.len() == before {
        return Err(InstancerError::NotFound {
            kind: "challenge",
            id: id.to_string(),
        });
    }
    Ok(())
}

/// Catalog held in process memory.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    entries: Mutex<Vec<ChallengeDescriptor>>,
}

impl MemoryCatalog {
    /// Creates a catalog holding `descriptors`.
    #[must_use]
    pub fn with(descriptors: impl IntoIterator<Item = ChallengeDescriptor>) -> Self {
        let catalog = Self::default();
        for d in descriptors {
            upsert(
                &mut catalog.entries.lock().unwrap_or_else(PoisonError::into_inner),
                d,
            );
        }
        catalog
    }
}

impl ChallengeCatalog for MemoryCatalog {
    fn list(&self) -> Result<Vec<ChallengeDescriptor>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn register(&self, descriptor: ChallengeDescriptor) -> Result<()> {
        upsert(
            &mut self.entries.lock().unwrap_or_else(PoisonError::into_inner),
            descriptor,
        );
        Ok(())
    }

    fn remove(&self, id: ChallengeId) -> Result<()> {
        take(
            &mut self.entries.lock().unwrap_or_else(PoisonError::into_inner),
            id,
        )
    }
}

/// Catalog backed by a JSON file.
#[derive(Debug)]
pub struct JsonCatalog {
    file: StateFile,
}

impl JsonCatalog {
    /// Opens or creates a catalog at `path`.
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

impl ChallengeCatalog for JsonCatalog {
    fn list(&self) -> Result<Vec<ChallengeDescriptor>> {
        self.file.read()
    }

    fn register(&self, descriptor: ChallengeDescriptor) -> Result<()> {
        tracing::info!(challenge = %descriptor.id, image = %descriptor.image, "challenge registered");
        self.file.update(|entries: &mut Vec<ChallengeDescriptor>| {
            upsert(entries, descriptor);
            Ok(())
        })
    }

    fn remove(&self, id: ChallengeId) -> Result<()> {
        self.file.update(|entries: &mut Vec<ChallengeDescriptor>| take(entries, id))
    }
}
