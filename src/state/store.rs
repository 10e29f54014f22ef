//! JSON document store backed by a directory

use crate::error::CoordinatorResult;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Stores each document as `<dir>/<key>.json`
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Create a store rooted at `dir`; the directory is created on first save
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the document for `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// Load a document, falling back to its default when missing or unreadable.
    ///
    /// A corrupt file is treated as a cold start and only logged.
    pub fn load<T>(&self, key: &str) -> T
    where
        T: DeserializeOwned + Default,
    {
        let path = self.path_for(key);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No state document at {:?}, starting empty", path);
                return T::default();
            }
            Err(e) => {
                warn!("Failed to read state document {:?}: {} - starting empty", path, e);
                return T::default();
            }
        };

        match serde_json::from_str(&contents) {
            Ok(document) => document,
            Err(e) => {
                warn!("Corrupt state document {:?}: {} - starting empty", path, e);
                T::default()
            }
        }
    }

    /// Persist a document atomically.
    ///
    /// The document is written to a uniquely named temp file in the same
    /// directory, synced, then renamed over the target.
    pub fn save<T>(&self, key: &str, document: &T) -> CoordinatorResult<()>
    where
        T: Serialize,
    {
        fs::create_dir_all(&self.dir)?;

        let bytes = serde_json::to_vec_pretty(document)?;
        let target = self.path_for(key);
        let temp_path = self.dir.join(format!(".{}.{}.tmp", key, Uuid::new_v4()));

        let written = Self::write_synced(&temp_path, &bytes)
            .and_then(|_| fs::rename(&temp_path, &target));

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        debug!("Saved state document {:?} ({} bytes)", target, bytes.len());
        Ok(())
    }

    /// Check that the state directory is writable
    pub fn health_check(&self) -> CoordinatorResult<()> {
        fs::create_dir_all(&self.dir)?;
        let marker = self.dir.join(format!(".health.{}", Uuid::new_v4()));
        Self::write_synced(&marker, b"ok")?;
        fs::remove_file(&marker)?;
        Ok(())
    }

    fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(bytes)?;
        file.sync_all()
    }
}
