use super::SyncError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointFile {
    last_access: i64,
}

/// Remote checkpoint persisted as `{"lastAccess": n}`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored checkpoint, or 0 when the file is missing or unreadable.
    pub async fn load(&self) -> i64 {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "checkpoint unreadable, starting over");
                return 0;
            }
        };
        match serde_json::from_slice::<CheckpointFile>(&bytes) {
            Ok(file) => file.last_access,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "checkpoint corrupt, starting over");
                0
            }
        }
    }

    /// Write through a sibling temp file and rename so a crash never leaves a torn file.
    pub async fn save(&self, last_access: i64) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec(&CheckpointFile { last_access })
            .map_err(|err| SyncError::Checkpoint(err.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
