//! Device customization persistence.
//!
//! The host keeps two integers chosen on the companion: the character and
//! the background. Storage sits behind the narrow `KeyValueStore` trait;
//! `FileStore` persists atomically with file locking, `MemoryStore` backs
//! tests. `ThemeStore` is the single writer and mirrors the values into
//! atomics so readers never take a lock.

use crate::wire::ThemePayload;
use crate::{Error, Result};
use fs2::FileExt;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tempfile::NamedTempFile;

pub const CHARACTER_KEY: &str = "theme.character_id";
pub const BACKGROUND_KEY: &str = "theme.background_id";

/// Integer key-value persistence
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<i32>>;
    fn set(&self, key: &str, value: i32) -> Result<()>;

    /// Write several keys as one unit
    fn set_many(&self, entries: &[(&str, i32)]) -> Result<()> {
        for (key, value) in entries {
            self.set(key, *value)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, i32>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<i32>> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).copied())
    }

    fn set(&self, key: &str, value: i32) -> Result<()> {
        self.set_many(&[(key, value)])
    }

    fn set_many(&self, entries: &[(&str, i32)]) -> Result<()> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in entries {
            values.insert(key.to_string(), *value);
        }
        Ok(())
    }
}

/// JSON file store, rewritten atomically on every set.
///
/// The in-memory map only changes once the file write succeeded.
pub struct FileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, i32>>,
}

impl FileStore {
    /// Open the store, starting empty if the file is missing or corrupt
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = load_values(&path)?;
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, i32>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<i32>> {
        Ok(self.lock().get(key).copied())
    }

    fn set(&self, key: &str, value: i32) -> Result<()> {
        self.set_many(&[(key, value)])
    }

    fn set_many(&self, entries: &[(&str, i32)]) -> Result<()> {
        let mut values = self.lock();
        let mut next = values.clone();
        for (key, value) in entries {
            next.insert(key.to_string(), *value);
        }
        save_values(&self.path, &next)?;
        *values = next;
        Ok(())
    }
}

fn load_values(path: &Path) -> Result<BTreeMap<String, i32>> {
    if !path.exists() {
        tracing::info!("No theme file found, using default theme");
        return Ok(BTreeMap::new());
    }

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!("Unable to open theme file {:?}: {}. Using defaults.", path, e);
            return Ok(BTreeMap::new());
        }
    };

    if let Err(e) = file.lock_shared() {
        tracing::warn!("Unable to lock theme file {:?}: {}. Using defaults.", path, e);
        return Ok(BTreeMap::new());
    }

    let mut contents = String::new();
    let read = std::io::BufReader::new(&file).read_to_string(&mut contents);
    file.unlock()?;
    if let Err(e) = read {
        tracing::warn!("Failed to read theme file {:?}: {}. Using defaults.", path, e);
        return Ok(BTreeMap::new());
    }

    match serde_json::from_str(&contents) {
        Ok(values) => {
            tracing::debug!("Loaded theme from {:?}", path);
            Ok(values)
        }
        Err(e) => {
            tracing::warn!("Failed to parse theme file {:?}: {}. Using defaults.", path, e);
            Ok(BTreeMap::new())
        }
    }
}

/// Temp file in the same directory, exclusive lock, fsync, rename
fn save_values(path: &Path, values: &BTreeMap<String, i32>) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "theme path missing parent")
    })?;
    std::fs::create_dir_all(parent)?;

    let temp = NamedTempFile::new_in(parent)?;
    temp.as_file().lock_exclusive()?;
    {
        let mut writer = std::io::BufWriter::new(temp.as_file());
        writer.write_all(serde_json::to_string(values)?.as_bytes())?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.as_file().unlock()?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;

    tracing::debug!("Saved theme to {:?}", path);
    Ok(())
}

/// Current customization choice
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Theme {
    pub character_id: i32,
    pub background_id: i32,
}

impl From<ThemePayload> for Theme {
    fn from(p: ThemePayload) -> Self {
        Self {
            character_id: p.character_id,
            background_id: p.background_id,
        }
    }
}

pub struct ThemeStore {
    store: Arc<dyn KeyValueStore>,
    character_id: AtomicI32,
    background_id: AtomicI32,
}

impl ThemeStore {
    pub fn open(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let character_id = store.get(CHARACTER_KEY)?.unwrap_or_default();
        let background_id = store.get(BACKGROUND_KEY)?.unwrap_or_default();
        Ok(Self {
            store,
            character_id: AtomicI32::new(character_id),
            background_id: AtomicI32::new(background_id),
        })
    }

    /// Lock-free read for the presentation layer
    pub fn current(&self) -> Theme {
        Theme {
            character_id: self.character_id.load(Ordering::Acquire),
            background_id: self.background_id.load(Ordering::Acquire),
        }
    }

    /// Persist a theme; returns whether anything changed
    pub fn apply(&self, theme: Theme) -> Result<bool> {
        if self.current() == theme {
            tracing::debug!("Theme unchanged ({:?})", theme);
            return Ok(false);
        }
        self.store.set_many(&[
            (CHARACTER_KEY, theme.character_id),
            (BACKGROUND_KEY, theme.background_id),
        ])?;
        self.character_id.store(theme.character_id, Ordering::Release);
        self.background_id.store(theme.background_id, Ordering::Release);
        tracing::info!(
            "Theme updated: character {}, background {}",
            theme.character_id,
            theme.background_id
        );
        Ok(true)
    }
}
