use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::config::Config;
use crate::error::{Error, Result};

/// Held for the duration of a sync. Releases the lock on drop.
pub struct SyncGuard {
    _held: Box<dyn Send>,
}

pub trait Store: Send + Sync {
    fn load_config(&self) -> Result<Option<Config>>;
    fn save_config(&self, config: &Config) -> Result<()>;
    fn load_cache(&self) -> Result<Option<Cache>>;
    fn save_cache(&self, cache: &Cache) -> Result<()>;

    /// Take the cross-process sync lock without waiting.
    ///
    /// Returns [`Error::SyncInProgress`] if someone else holds it.
    fn try_lock_sync(&self) -> Result<SyncGuard>;

    /// Take the sync lock, waiting for a running sync to finish.
    fn lock_sync(&self) -> Result<SyncGuard>;
}

/// JSON files on disk: `config.json`, `cache.json` and `sync.lock`.
#[derive(Debug, Clone)]
pub struct FileStore {
    config_path: PathBuf,
    cache_path: PathBuf,
    lock_path: PathBuf,
}

impl FileStore {
    pub fn new(
        config_path: impl Into<PathBuf>,
        cache_path: impl Into<PathBuf>,
        lock_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config_path: config_path.into(),
            cache_path: cache_path.into(),
            lock_path: lock_path.into(),
        }
    }
}

impl Store for FileStore {
    fn load_config(&self) -> Result<Option<Config>> {
        read_json(&self.config_path)
    }

    fn save_config(&self, config: &Config) -> Result<()> {
        write_json_atomic(&self.config_path, config)
    }

    fn load_cache(&self) -> Result<Option<Cache>> {
        // The cache can always be rebuilt, so a damaged file is not fatal.
        match read_json(&self.cache_path) {
            Err(Error::Decode(e)) => {
                warn!(path = %self.cache_path.display(), error = %e, "Discarding unreadable cache");
                Ok(None)
            }
            other => other,
        }
    }

    fn save_cache(&self, cache: &Cache) -> Result<()> {
        write_json_atomic(&self.cache_path, cache)
    }

    fn try_lock_sync(&self) -> Result<SyncGuard> {
        let file = self.open_lock_file()?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %self.lock_path.display(), "Acquired sync lock");
                Ok(SyncGuard {
                    _held: Box::new(file),
                })
            }
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(Error::SyncInProgress(self.lock_path.clone()))
            }
            Err(e) => Err(Error::persistence(&self.lock_path, e)),
        }
    }

    fn lock_sync(&self) -> Result<SyncGuard> {
        let file = self.open_lock_file()?;
        file.lock_exclusive()
            .map_err(|e| Error::persistence(&self.lock_path, e))?;
        debug!(path = %self.lock_path.display(), "Acquired sync lock");
        Ok(SyncGuard {
            _held: Box::new(file),
        })
    }
}

impl FileStore {
    fn open_lock_file(&self) -> Result<fs::File> {
        ensure_parent(&self.lock_path)?;
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| Error::persistence(&self.lock_path, e))
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::persistence(path, e))?;
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::persistence(path, e)),
    };
    Ok(Some(serde_json::from_slice(&data)?))
}

/// Write to a temp file next to `path`, then rename it into place.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let json = serde_json::to_vec_pretty(value)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::persistence(path, e))?;
    tmp.write_all(&json)
        .and_then(|()| tmp.write_all(b"\n"))
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| Error::persistence(path, e))?;
    tmp.persist(path)
        .map_err(|e| Error::persistence(path, e.error))?;

    debug!(path = %path.display(), "Saved");
    Ok(())
}

#[cfg(test)]
pub use memory::MemoryStore;
