//! Bundled image resources

use crate::error::{LoadError, LoadResult};
use crate::request::ResourceId;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Looks up the encoded bytes of a bundled resource
pub trait ResourceBundle: Send + Sync {
    fn open(&self, id: ResourceId) -> LoadResult<Vec<u8>>;
}

/// Resources stored as files named after their id (`42.png`, `42.webp`)
#[derive(Debug, Clone)]
pub struct DirectoryBundle {
    root: PathBuf,
}

impl DirectoryBundle {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn find(&self, id: ResourceId) -> io::Result<Option<PathBuf>> {
        let stem = id.to_string();
        let mut matches: Vec<PathBuf> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| path.file_stem().and_then(|s| s.to_str()) == Some(stem.as_str()))
            .collect();
        // Deterministic pick when several extensions exist
        matches.sort();
        Ok(matches.into_iter().next())
    }
}

impl ResourceBundle for DirectoryBundle {
    fn open(&self, id: ResourceId) -> LoadResult<Vec<u8>> {
        let path = self
            .find(id)
            .map_err(|source| LoadError::Io {
                path: self.root.clone(),
                source,
            })?
            .ok_or(LoadError::ResourceNotFound(id))?;

        fs::read(&path).map_err(|source| LoadError::Io { path, source })
    }
}

/// Resources held in memory, registered by the host at startup
#[derive(Default)]
pub struct MemoryBundle {
    entries: Mutex<HashMap<ResourceId, Arc<[u8]>>>,
}

impl MemoryBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: ResourceId, bytes: impl Into<Arc<[u8]>>) {
        self.entries.lock().unwrap().insert(id, bytes.into());
    }

    pub fn with(self, id: ResourceId, bytes: impl Into<Arc<[u8]>>) -> Self {
        self.insert(id, bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResourceBundle for MemoryBundle {
    fn open(&self, id: ResourceId) -> LoadResult<Vec<u8>> {
        self.entries
            .lock()
            .unwrap()
            .get(&id)
            .map(|bytes| bytes.to_vec())
            .ok_or(LoadError::ResourceNotFound(id))
    }
}
