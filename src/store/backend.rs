//! Storage backends for channel records
//!
//! A backend stores opaque record bytes per channel. Every `put` must be
//! atomic: a concurrent reader sees either the old record or the new one.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use crate::errors::{Result, StoreError};
use crate::types::ChannelId;

/// File extension of channel records in a [`FileBackend`]
pub const RECORD_EXTENSION: &str = "chan";

/// Backend trait for storing and retrieving channel records
///
/// This trait abstracts over storage media so the store logic works the
/// same against memory, plain files or a host wallet's own database.
pub trait StoreBackend: Send + Sync {
    /// Gets a record by channel id
    ///
    /// # Returns
    /// `Ok(Some(bytes))` if found, `Ok(None)` if not found, or error
    fn get(&self, channel_id: &ChannelId) -> Result<Option<Vec<u8>>>;

    /// Atomically stores a record, replacing any previous one
    fn put(&self, channel_id: &ChannelId, record: &[u8]) -> Result<()>;

    /// Deletes a record; deleting a missing record is not an error
    fn delete(&self, channel_id: &ChannelId) -> Result<()>;

    /// Lists the ids of all stored records
    fn list(&self) -> Result<Vec<ChannelId>>;
}

/// Backend keeping records in memory
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: RwLock<BTreeMap<ChannelId, Vec<u8>>>,
}

impl MemoryBackend {
    /// Creates an empty backend
    pub fn new() -> Self { Self::default() }
}

impl StoreBackend for MemoryBackend {
    fn get(&self, channel_id: &ChannelId) -> Result<Option<Vec<u8>>> {
        Ok(self.records.read().unwrap_or_else(PoisonError::into_inner).get(channel_id).cloned())
    }

    fn put(&self, channel_id: &ChannelId, record: &[u8]) -> Result<()> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*channel_id, record.to_vec());
        Ok(())
    }

    fn delete(&self, channel_id: &ChannelId) -> Result<()> {
        self.records.write().unwrap_or_else(PoisonError::into_inner).remove(channel_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<ChannelId>> {
        Ok(self.records.read().unwrap_or_else(PoisonError::into_inner).keys().copied().collect())
    }
}

/// Backend keeping one file per channel in a directory
///
/// Writes go to a temporary file in the same directory which is fsynced and
/// then renamed over the record.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

fn io_error(context: &str, path: &Path, err: impl std::fmt::Display) -> StoreError {
    StoreError::Io(format!("{context} {}: {err}", path.display()))
}

impl FileBackend {
    /// Opens (creating if needed) a record directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| io_error("failed to create", &dir, e))?;
        Ok(Self { dir })
    }

    /// Directory holding the records
    pub fn dir(&self) -> &Path { &self.dir }

    fn record_path(&self, channel_id: &ChannelId) -> PathBuf {
        self.dir.join(format!("{}.{RECORD_EXTENSION}", channel_id.to_hex()))
    }
}

impl StoreBackend for FileBackend {
    fn get(&self, channel_id: &ChannelId) -> Result<Option<Vec<u8>>> {
        let path = self.record_path(channel_id);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("failed to read", &path, e).into()),
        }
    }

    fn put(&self, channel_id: &ChannelId, record: &[u8]) -> Result<()> {
        let path = self.record_path(channel_id);
        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| io_error("failed to create temp file in", &self.dir, e))?;
        temp.write_all(record).map_err(|e| io_error("failed to write", temp.path(), e))?;
        temp.as_file().sync_all().map_err(|e| io_error("failed to sync", temp.path(), e))?;
        temp.persist(&path).map_err(|e| io_error("failed to persist", &path, e))?;

        // Best effort: make the rename itself durable
        if let Ok(dir) = fs::File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    fn delete(&self, channel_id: &ChannelId) -> Result<()> {
        let path = self.record_path(channel_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("failed to delete", &path, e).into()),
        }
    }

    fn list(&self) -> Result<Vec<ChannelId>> {
        let entries =
            fs::read_dir(&self.dir).map_err(|e| io_error("failed to list", &self.dir, e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| io_error("failed to list", &self.dir, e))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|s| s.to_str()).and_then(ChannelId::from_hex)
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}
