//! Durable key/value storage shared by every context of one origin.
//!
//! A [`SharedStorage`] is the origin-wide store (think: one cache directory,
//! or one browser profile's local storage). Each running engine connects to
//! it through its own [`StorageHandle`]. Writes through a handle are visible
//! to all handles, and raise a change event in every *other* context; the
//! writer never hears about its own writes.
//!
//! Values are JSON text. Two media are provided: an in-memory map (tests,
//! ephemeral sessions) and a directory of JSON files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};

/// Capacity of the change-event channel.
/// Receivers that fall further behind skip events (and log a warning).
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// File extension for entries in the file medium.
const FILE_EXTENSION: &str = "json";

/// Identifies one connected context.
pub type ContextId = u64;

/// A change made by some context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
    pub origin: ContextId,
}

/// The raw medium behind a [`SharedStorage`].
pub trait StorageMedium: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>>;
    fn write(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;
}

/// Process-local map medium.
#[derive(Debug, Default)]
pub struct MemoryMedium {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageMedium for MemoryMedium {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.keys().cloned().collect())
    }
}

/// One JSON file per key in a cache directory.
///
/// Keys are hex-encoded into file names so any key is a valid, reversible
/// file name on every platform.
#[derive(Debug)]
pub struct FileMedium {
    dir: PathBuf,
}

impl FileMedium {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", hex::encode(key.as_bytes()), FILE_EXTENSION))
    }

    fn key_for(path: &Path) -> Option<String> {
        if path.extension()? != FILE_EXTENSION {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let bytes = hex::decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }
}

impl StorageMedium for FileMedium {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| CacheError::Storage(format!("failed to read {}: {}", key, e)))?;
        Ok(Some(contents))
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        // Write to a sibling file and rename so readers never see a torn value
        // Unique per write: other processes may be writing the same key
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("{:08x}.tmp", rand::random::<u32>()));
        std::fs::write(&tmp, value)
            .map_err(|e| CacheError::Storage(format!("failed to write {}: {}", key, e)))?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(CacheError::Storage(format!("failed to replace {}: {}", key, e)));
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| CacheError::Storage(format!("failed to remove {}: {}", key, e)))?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for dir_entry in std::fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            if let Some(key) = Self::key_for(&path) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

/// Origin-wide storage that contexts connect to.
/// Clone is cheap - the medium and event channel are shared.
#[derive(Clone)]
pub struct SharedStorage {
    medium: Arc<dyn StorageMedium>,
    events: broadcast::Sender<StorageEvent>,
}

impl SharedStorage {
    pub fn with_medium(medium: Arc<dyn StorageMedium>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { medium, events }
    }

    pub fn in_memory() -> Self {
        Self::with_medium(Arc::new(MemoryMedium::new()))
    }

    pub fn on_disk(dir: PathBuf) -> Result<Self> {
        Ok(Self::with_medium(Arc::new(FileMedium::new(dir)?)))
    }

    /// Open a new context on this storage.
    pub fn connect(&self) -> StorageHandle {
        let context = rand::random::<ContextId>();
        debug!(context, "Context connected to shared storage");
        StorageHandle {
            context,
            medium: Arc::clone(&self.medium),
            events: self.events.clone(),
        }
    }
}

/// One context's view of a [`SharedStorage`].
#[derive(Clone)]
pub struct StorageHandle {
    context: ContextId,
    medium: Arc<dyn StorageMedium>,
    events: broadcast::Sender<StorageEvent>,
}

impl StorageHandle {
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.medium.read(key)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.medium.write(key, value)?;
        self.notify(key, Some(value.to_string()));
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.medium.delete(key)?;
        self.notify(key, None);
        Ok(())
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.medium.keys()
    }

    /// Change events raised by other contexts.
    pub fn subscribe(&self) -> StorageEvents {
        StorageEvents {
            context: self.context,
            rx: self.events.subscribe(),
        }
    }

    fn notify(&self, key: &str, new_value: Option<String>) {
        // No receivers is fine: nobody else is connected
        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            new_value,
            origin: self.context,
        });
    }
}

/// Stream of storage events from other contexts.
pub struct StorageEvents {
    context: ContextId,
    rx: broadcast::Receiver<StorageEvent>,
}

impl StorageEvents {
    /// Wait for the next event from another context. `None` once the storage
    /// has been dropped by every context.
    pub async fn recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.origin == self.context => continue,
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(context = self.context, skipped, "Storage listener lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
