use super::{RemoteSource, SyncError};
use crate::storage::{AttachmentRow, MirrorDb};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Local attachment directory. Each attachment is downloaded at most once.
#[derive(Debug, Clone)]
pub struct AttachmentCache {
    dir: PathBuf,
}

impl AttachmentCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<id>_<basename>` with anything outside `[A-Za-z0-9._-]` replaced.
    pub fn local_path(&self, attachment_id: i64, remote_name: Option<&str>) -> PathBuf {
        let basename = remote_name
            .and_then(|name| name.rsplit(['/', '\\']).next())
            .filter(|name| !name.is_empty())
            .unwrap_or("attachment");
        let sanitized: String = basename
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let sanitized = sanitized.trim_start_matches('.');
        self.dir.join(format!("{attachment_id}_{sanitized}"))
    }

    /// Fetch whatever is not cached yet and point the mirror rows at local files.
    ///
    /// Rows without a remote path have nothing to fetch and are left alone.
    /// Returns the number of downloads. Any failure aborts so the caller can
    /// hold its checkpoint and retry the whole batch.
    pub async fn sync(
        &self,
        remote: &dyn RemoteSource,
        db: &MirrorDb,
        rows: &[AttachmentRow],
    ) -> Result<usize, SyncError> {
        if rows.is_empty() {
            return Ok(0);
        }
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut downloaded = 0;
        for row in rows {
            let Some(attachment_id) = row.rowid else {
                continue;
            };
            let Some(remote_name) = row.filename.as_deref().filter(|name| !name.is_empty()) else {
                debug!(attachment_id, "attachment has no remote path");
                continue;
            };
            if let Some(recorded) = db.attachment_path(attachment_id)? {
                if tokio::fs::try_exists(&recorded).await? {
                    continue;
                }
            }

            let path = self.local_path(attachment_id, Some(remote_name));
            if tokio::fs::try_exists(&path).await? {
                debug!(attachment_id, "attachment already cached");
            } else {
                let bytes = remote.fetch_attachment(attachment_id).await?;
                let tmp = path.with_extension("part");
                tokio::fs::write(&tmp, &bytes).await?;
                tokio::fs::rename(&tmp, &path).await?;
                downloaded += 1;
                info!(attachment_id, size = bytes.len(), "attachment cached");
            }
            db.set_attachment_path(attachment_id, &path.to_string_lossy())?;
        }
        Ok(downloaded)
    }
}
