use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Per-track metadata stored next to the audio as `{id}.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub id: String,
    pub title: String,
    /// Whole seconds.
    pub duration: u32,
    pub source_uri: String,
}

pub fn audio_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.mp3"))
}

pub fn sidecar_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.json"))
}

// The acquirer files audio under the id *it* resolves, and two catalog
// entries can resolve to the same upstream video (a `youtu.be` link and a
// `/shorts/` link, say). Each job therefore gets its own scratch directory
// and only ever moves its own output into place; a finished entry's audio
// is never the source of someone else's rename.
/// Working directory for one staging job, keyed by the catalog id.
pub fn scratch_dir(dir: &Path, id: &str) -> PathBuf {
    dir.join(".partial").join(id)
}

fn temp_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.json.tmp"))
}

/// Write the sidecar through a temp file and a rename, so a reader never
/// sees a half-written document.
pub async fn write(dir: &Path, meta: &TrackMetadata) -> Result<()> {
    let body = serde_json::to_vec_pretty(meta)?;
    let tmp = temp_path(dir, &meta.id);
    tokio::fs::write(&tmp, &body).await?;
    if let Err(e) = tokio::fs::rename(&tmp, sidecar_path(dir, &meta.id)).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Load a sidecar. `Ok(None)` when there is none; `MetadataCorrupt` when it
/// exists but cannot be used for `id`.
pub async fn read(dir: &Path, id: &str) -> Result<Option<TrackMetadata>> {
    let path = sidecar_path(dir, id);
    let raw = match tokio::fs::read(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let meta: TrackMetadata =
        serde_json::from_slice(&raw).map_err(|e| EngineError::MetadataCorrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    if meta.id != id || meta.duration == 0 {
        return Err(EngineError::MetadataCorrupt {
            path: path.display().to_string(),
            reason: format!("id {:?} duration {}", meta.id, meta.duration),
        });
    }
    Ok(Some(meta))
}

/// Drop a stale temp file left behind by a crash mid-write.
pub async fn remove_temp(dir: &Path, id: &str) {
    let _ = tokio::fs::remove_file(temp_path(dir, id)).await;
}
