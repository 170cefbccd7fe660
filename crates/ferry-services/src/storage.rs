//! Where payloads come from and where received ones go.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use ferry_core::TransferError;

use crate::session::SessionKey;

/// Payload source for exports and sink for completed imports.
pub trait PayloadStore: Send + Sync {
    /// Read the payload to export. Missing source is `SourceNotFound`.
    fn load(&self) -> Result<Bytes, TransferError>;

    /// Persist a completed import. Returns where it landed.
    fn persist(&self, key: &SessionKey, payload: &[u8]) -> Result<PathBuf, TransferError>;
}

/// A single data file, the way the CLI uses it.
///
/// Writes go to a sibling temp file first and are renamed into place, so a
/// reader never sees a half-written payload. Concurrent completions overwrite
/// each other; the last rename wins.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self, key: &SessionKey) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "payload".to_string());
        self.path
            .with_file_name(format!(".{name}.{}.part", key.session_id))
    }

    fn storage_error(&self, source: io::Error) -> TransferError {
        TransferError::Storage {
            path: self.path.clone(),
            source,
        }
    }
}

impl PayloadStore for FileStore {
    fn load(&self) -> Result<Bytes, TransferError> {
        match std::fs::read(&self.path) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(TransferError::SourceNotFound(self.path.clone()))
            }
            Err(e) => Err(self.storage_error(e)),
        }
    }

    fn persist(&self, key: &SessionKey, payload: &[u8]) -> Result<PathBuf, TransferError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| self.storage_error(e))?;
            }
        }

        let temp = self.temp_path(key);
        if let Err(e) = std::fs::write(&temp, payload) {
            let _ = std::fs::remove_file(&temp);
            return Err(self.storage_error(e));
        }
        if let Err(e) = std::fs::rename(&temp, &self.path) {
            let _ = std::fs::remove_file(&temp);
            return Err(self.storage_error(e));
        }

        tracing::debug!(path = %self.path.display(), bytes = payload.len(), %key, "payload persisted");
        Ok(self.path.clone())
    }
}
