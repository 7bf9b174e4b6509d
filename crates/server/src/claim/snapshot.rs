//! Persisted claim snapshot (`claims.json`)
//!
//! Written on every claim state change so a restarted daemon knows which
//! devices to re-verify. The body carries a CRC32 of the claim list; a
//! snapshot that fails the check is discarded, never trusted.

use protocol::ClaimRecord;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use super::ClaimError;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    checksum: u32,
    claims: Vec<ClaimRecord>,
}

fn checksum(claims: &[ClaimRecord]) -> Result<u32, ClaimError> {
    let body = serde_json::to_vec(claims).map_err(|e| ClaimError::Persistence(e.to_string()))?;
    Ok(crc32fast::hash(&body))
}

pub struct ClaimSnapshot {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ClaimSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted claims; a missing file is an empty snapshot
    pub async fn load(&self) -> Result<Vec<ClaimRecord>, ClaimError> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ClaimError::Persistence(format!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        let file: SnapshotFile = serde_json::from_slice(&content).map_err(|e| {
            ClaimError::Persistence(format!("invalid snapshot {}: {}", self.path.display(), e))
        })?;

        if file.version != SNAPSHOT_VERSION {
            return Err(ClaimError::Persistence(format!(
                "unsupported snapshot version {}",
                file.version
            )));
        }
        if checksum(&file.claims)? != file.checksum {
            return Err(ClaimError::Persistence(format!(
                "checksum mismatch in {}",
                self.path.display()
            )));
        }

        Ok(file.claims)
    }

    /// Persist the claim list produced by `collect`
    ///
    /// `collect` runs under the writer lock, so the last write to land is
    /// always built from the newest state.
    pub async fn save_with<F>(&self, collect: F) -> Result<(), ClaimError>
    where
        F: FnOnce() -> Vec<ClaimRecord>,
    {
        let _guard = self.write_lock.lock().await;
        let claims = collect();
        let file = SnapshotFile {
            version: SNAPSHOT_VERSION,
            checksum: checksum(&claims)?,
            claims,
        };
        let content = serde_json::to_vec_pretty(&file)
            .map_err(|e| ClaimError::Persistence(e.to_string()))?;

        write_atomic(&self.path, &content)
            .await
            .map_err(|e| {
                ClaimError::Persistence(format!("failed to write {}: {}", self.path.display(), e))
            })?;

        debug!(
            "Saved claim snapshot ({} claims) to {}",
            file.claims.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// Write through a temp file and rename, so readers never see a partial file
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await
}
