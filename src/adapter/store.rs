//! Durable storage for the pre-redirection snapshot.
//!
//! The snapshot is a JSON object mapping adapter names to DNS server lists:
//!
//! ```json
//! {
//!   "Ethernet": ["192.168.1.1", "8.8.8.8"]
//! }
//! ```
//!
//! Writes go to a temporary file in the same directory which then replaces
//! the target, so a reader never sees a partial file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::AdapterSnapshot;
use crate::error::SnapshotError;

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the stored snapshot.
    pub fn persist(&self, snapshot: &AdapterSnapshot) -> Result<(), SnapshotError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|source| self.io_error(dir, source))?;

        let mut file = NamedTempFile::new_in(dir).map_err(|source| self.io_error(dir, source))?;
        serde_json::to_writer_pretty(&mut file, snapshot).map_err(|source| SnapshotError::Json {
            path: self.path.clone(),
            source,
        })?;
        file.flush().map_err(|source| self.io_error(&self.path, source))?;
        file.persist(&self.path)?;

        tracing::debug!(path = ?self.path, adapters = snapshot.len(), "persisted DNS snapshot");
        Ok(())
    }

    /// Read the stored snapshot, `None` if there is none.
    pub fn load(&self) -> Result<Option<AdapterSnapshot>, SnapshotError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(self.io_error(&self.path, source)),
        };

        let snapshot = serde_json::from_str(&content).map_err(|source| SnapshotError::Json {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(snapshot))
    }

    fn io_error(&self, path: &Path, source: io::Error) -> SnapshotError {
        SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
