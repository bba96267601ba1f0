//! JSON snapshot persistence for ledger state.
//!
//! Provides [`JsonStore`], which serializes one value per domain to
//! `{state_path}/state/{domain}.json`. Writes go to a sibling temp file that is
//! renamed over the target, so a reader never observes a half-written snapshot.

#![forbid(unsafe_code)]

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode state for {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type PersistResult<T> = Result<T, PersistError>;

/// A JSON file holding the snapshot of a single domain of data.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    /// Create a store for the given domain under `state_path`.
    pub fn new(state_path: &Path, domain: &str) -> Self {
        let path = state_path.join("state").join(format!("{domain}.json"));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot. Returns `None` when no snapshot has been written yet.
    ///
    /// A file that exists but does not parse is an error: callers hold
    /// balances here and must not silently start from empty.
    pub fn load<T: DeserializeOwned>(&self) -> PersistResult<Option<T>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no state file, starting fresh");
                return Ok(None);
            }
            Err(source) => return Err(PersistError::Io { path: self.path.clone(), source }),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| PersistError::Corrupt { path: self.path.clone(), source })
    }

    /// Atomically replace the snapshot. Creates directories as needed.
    pub fn save<T: Serialize>(&self, data: &T) -> PersistResult<()> {
        let io_err = |source| PersistError::Io { path: self.path.clone(), source };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = serde_json::to_vec_pretty(data)
            .map_err(|source| PersistError::Encode { path: self.path.clone(), source })?;

        let tmp = self.path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&content).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;

        debug!(path = %self.path.display(), bytes = content.len(), "state snapshot written");
        Ok(())
    }
}
