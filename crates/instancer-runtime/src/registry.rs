//! Instance registry: durable mapping from (challenge, team) to container.
//!
//! The file-backed store keeps a JSON index on disk and re-reads it on
//! every operation. Mutations hold an exclusive file lock across the
//! whole read-modify-write, so CLI invocations and `serve` sharing a data
//! directory never overwrite each other's records.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use instancer_common::error::{InstancerError, Result};
use instancer_common::types::{ContainerId, InstanceKey, InstanceRecord};

use crate::state_file::StateFile;

/// Persistence for instance records.
///
/// Calls are short and local; no method blocks on the container runtime.
pub trait InstanceStore: Send + Sync {
    /// Returns every record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn list(&self) -> Result<Vec<InstanceRecord>>;

    /// Finds the record owned by `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn find(&self, key: InstanceKey) -> Result<Option<InstanceRecord>>;

    /// Finds the record for a container identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get(&self, id: &ContainerId) -> Result<Option<InstanceRecord>>;

    /// Inserts a record, replacing any record with the same container id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn insert(&self, record: InstanceRecord) -> Result<()>;

    /// Replaces the expiry of an existing record.
    ///
    /// # Errors
    ///
    /// Returns [`InstancerError::NotFound`] if no record has that id.
    fn set_expiry(&self, id: &ContainerId, expires_at: i64) -> Result<InstanceRecord>;

    /// Removes a record, returning it if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn remove(&self, id: &ContainerId) -> Result<Option<InstanceRecord>>;
}

fn find_in(records: &[InstanceRecord], key: InstanceKey) -> Option<InstanceRecord> {
    records.iter().find(|r| r.key() == key).cloned()
}

fn get_in(records: &[InstanceRecord], id: &ContainerId) -> Option<InstanceRecord> {
    records.iter().find(|r| r.container_id == *id).cloned()
}

fn insert_in(records: &mut Vec<InstanceRecord>, record: InstanceRecord) {
    records.retain(|r| r.container_id != record.container_id);
    records.push(record);
}

fn set_expiry_in(
    records: &mut [InstanceRecord],
    id: &ContainerId,
    expires_at: i64,
) -> Result<InstanceRecord> {
    let record = records
        .iter_mut()
        .find(|r| r.container_id == *id)
        .ok_or_else(|| InstancerError::NotFound {
            kind: "instance",
            id: id.to_string(),
        })?;
    record.expires_at = expires_at;
    Ok(record.clone())
}

fn remove_in(records: &mut Vec<InstanceRecord>, id: &ContainerId) -> Option<InstanceRecord> {
    let pos = records.iter().position(|r| r.container_id == *id)?;
    Some(records.remove(pos))
}

/// Registry held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<InstanceRecord>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Vec<InstanceRecord>) -> T) -> T {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut records)
    }
}

impl InstanceStore for MemoryStore {
    fn list(&self) -> Result<Vec<InstanceRecord>> {
        Ok(self.with(|r| r.clone()))
    }

    fn find(&self, key: InstanceKey) -> Result<Option<InstanceRecord>> {
        Ok(self.with(|r| find_in(r, key)))
    }

    fn get(&self, id: &ContainerId) -> Result<Option<InstanceRecord>> {
        Ok(self.with(|r| get_in(r, id)))
    }

    fn insert(&self, record: InstanceRecord) -> Result<()> {
        self.with(|r| insert_in(r, record));
        Ok(())
    }

    fn set_expiry(&self, id: &ContainerId, expires_at: i64) -> Result<InstanceRecord> {
        self.with(|r| set_expiry_in(r, id, expires_at))
    }

    fn remove(&self, id: &ContainerId) -> Result<Option<InstanceRecord>> {
        Ok(self.with(|r| remove_in(r, id)))
    }
}

/// Registry backed by a JSON file.
#[derive(Debug)]
pub struct JsonFileStore {
    file: StateFile,
}

impl JsonFileStore {
    /// Opens the store at `path`, creating the parent directory.
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

impl InstanceStore for JsonFileStore {
    fn list(&self) -> Result<Vec<InstanceRecord>> {
        self.file.read()
    }

    fn find(&self, key: InstanceKey) -> Result<Option<InstanceRecord>> {
        Ok(find_in(&self.list()?, key))
    }

    fn get(&self, id: &ContainerId) -> Result<Option<InstanceRecord>> {
        Ok(get_in(&self.list()?, id))
    }

    fn insert(&self, record: InstanceRecord) -> Result<()> {
        self.file.update(|r| {
            insert_in(r, record);
            Ok(())
        })
    }

    fn set_expiry(&self, id: &ContainerId, expires_at: i64) -> Result<InstanceRecord> {
        self.file.update(|r: &mut Vec<InstanceRecord>| set_expiry_in(r, id, expires_at))
    }

    fn remove(&self, id: &ContainerId) -> Result<Option<InstanceRecord>> {
        self.file.update(|r| Ok(remove_in(r, id)))
    }
}
