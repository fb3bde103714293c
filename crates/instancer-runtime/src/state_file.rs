//! JSON state files shared between processes.
//!
//! Every CLI invocation is its own process working on the same data
//! directory, and `serve` sweeps the registry concurrently with them. Each
//! access takes an advisory `flock` on a sibling `.lock` file: shared for
//! reads, exclusive for the whole read-modify-write. Writes land in a
//! temporary file unique to the writer, then are renamed over the target.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use instancer_common::error::{InstancerError, Result};
use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;
use serde::de::DeserializeOwned;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A JSON document on disk guarded by a cross-process lock.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
    lock_path: PathBuf,
}

impl StateFile {
    /// Binds to `path`, creating its parent directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        ensure_parent(&path)?;
        let lock_path = sibling(&path, "lock");
        Ok(Self { path, lock_path })
    }

    /// Reads the document under a shared lock. A missing or empty file
    /// reads as the default value.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock or the file cannot be read, or the
    /// content is not valid JSON for `T`.
    pub fn read<T>(&self) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let _lock = self.acquire(FlockArg::LockShared)?;
        load_json(&self.path)
    }

    /// Reads, modifies, and writes back the document under an exclusive
    /// lock. Nothing is written if `f` fails.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or any lock, read, or write failure.
    pub fn update<T, R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        let _lock = self.acquire(FlockArg::LockExclusive)?;
        let mut value: T = load_json(&self.path)?;
        let out = f(&mut value)?;
        save_json(&self.path, &value)?;
        Ok(out)
    }

    fn acquire(&self, mode: FlockArg) -> Result<Flock<File>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| self.lock_error(e))?;
        Flock::lock(file, mode).map_err(|(_, errno)| self.lock_error(errno.into()))
    }

    fn lock_error(&self, source: std::io::Error) -> InstancerError {
        InstancerError::Io {
            path: self.lock_path.clone(),
            source,
        }
    }
}

/// `instances.json` + `lock` -> `instances.json.lock`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| InstancerError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

fn load_json<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match std::fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Ok(T::default()),
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(InstancerError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    let tmp = sibling(
        path,
        &format!(
            "{}.{}.tmp",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ),
    );
    std::fs::write(&tmp, content).map_err(|e| InstancerError::Io {
        path: tmp.clone(),
        source: e,
    })?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(InstancerError::Io {
            path: path.to_path_buf(),
            source: e,
        });
    }
    tracing::debug!(path = %path.display(), "state written");
    Ok(())
}
