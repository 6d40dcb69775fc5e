//! Device-scoped key/value persistence.

use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Context;

use crate::{ChatError, ChatResult};

pub trait LocalStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> ChatResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> ChatResult<()> {
        self.entries
            .lock()
            .map_err(|_| ChatError::Storage(anyhow::anyhow!("storage lock poisoned")))?
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// All keys live in one JSON object on disk, rewritten on every `set`.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> anyhow::Result<BTreeMap<String, String>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("{} is not a storage file", self.path.display())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl LocalStorage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock().ok()?;
        match self.read_all() {
            Ok(mut entries) => entries.remove(key),
            Err(e) => {
                tracing::warn!("reading {key} from local storage: {e:#}");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> ChatResult<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| ChatError::Storage(anyhow::anyhow!("storage lock poisoned")))?;
        // a corrupt file is replaced rather than blocking every future write
        let mut entries = self.read_all().unwrap_or_default();
        entries.insert(key.to_owned(), value.to_owned());
        let text = serde_json::to_string_pretty(&entries).map_err(|e| ChatError::Storage(e.into()))?;
        fs::write(&self.path, text)
            .with_context(|| format!("writing {}", self.path.display()))
            .map_err(ChatError::Storage)
    }
}
