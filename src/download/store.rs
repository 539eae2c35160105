//! Local model store: verified artifacts, their metadata and resumable partials

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::ModelDescriptor;
use crate::error::{Result, RuntimeError};

/// Persisted next to a partial file so a transfer can resume after a restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeMarker {
    pub model_id: String,
    pub checksum: String,
    pub total_bytes: u64,
    /// Bytes known to be durably written to the partial file
    pub confirmed_offset: u64,
}

/// Cached facts about a verified local artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalModel {
    pub model_id: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub artifact_path: PathBuf,
    pub downloaded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub use_count: u64,
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> RuntimeError {
    RuntimeError::model(format!("Failed to {} {}: {}", action, path.display(), e))
        .with_context("path", path.display())
}

/// Paths and metadata under `models/` and `temp/`
#[derive(Debug, Clone)]
pub struct ModelStore {
    models_dir: PathBuf,
    temp_dir: PathBuf,
}

impl ModelStore {
    pub fn new(models_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            models_dir: models_dir.into(),
            temp_dir: temp_dir.into(),
        };
        for dir in [&store.models_dir, &store.temp_dir] {
            std::fs::create_dir_all(dir).map_err(|e| io_error("create", dir, e))?;
        }
        Ok(store)
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Default location of a model's verified artifact
    pub fn artifact_path(&self, model_id: &str) -> PathBuf {
        self.models_dir.join(format!("{}.bin", model_id))
    }

    pub fn metadata_path(&self, model_id: &str) -> PathBuf {
        self.models_dir.join(format!("{}.json", model_id))
    }

    pub fn partial_path(&self, model_id: &str) -> PathBuf {
        self.temp_dir.join(format!("{}.part", model_id))
    }

    pub fn marker_path(&self, model_id: &str) -> PathBuf {
        self.temp_dir.join(format!("{}.resume.json", model_id))
    }

    pub fn local_model(&self, model_id: &str) -> Option<LocalModel> {
        let path = self.metadata_path(model_id);
        let json = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&json) {
            Ok(local) => Some(local),
            Err(e) => {
                warn!("Ignoring unreadable model metadata {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Verified artifact for this exact descriptor, if present on disk
    pub fn verified_artifact(&self, descriptor: &ModelDescriptor) -> Option<LocalModel> {
        let local = self.local_model(&descriptor.id)?;
        let on_disk = std::fs::metadata(&local.artifact_path).ok()?;

        let matches = local.checksum == descriptor.checksum
            && local.size_bytes == descriptor.size_bytes
            && on_disk.len() == descriptor.size_bytes;
        matches.then_some(local)
    }

    pub fn is_verified(&self, descriptor: &ModelDescriptor) -> bool {
        self.verified_artifact(descriptor).is_some()
    }

    /// All verified local models, sorted by id
    pub fn list_local(&self) -> Vec<LocalModel> {
        let Ok(entries) = std::fs::read_dir(&self.models_dir) else {
            return Vec::new();
        };

        let mut models: Vec<LocalModel> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    return None;
                }
                // models/ also holds the catalog document, which is not a LocalModel
                let json = std::fs::read_to_string(&path).ok()?;
                serde_json::from_str::<LocalModel>(&json).ok()
            })
            .filter(|local| local.artifact_path.exists())
            .collect();

        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        models
    }

    pub fn record_download(&self, descriptor: &ModelDescriptor, artifact_path: &Path) -> Result<LocalModel> {
        let local = LocalModel {
            model_id: descriptor.id.clone(),
            checksum: descriptor.checksum.clone(),
            size_bytes: descriptor.size_bytes,
            artifact_path: artifact_path.to_path_buf(),
            downloaded_at: Utc::now(),
            last_used: None,
            use_count: 0,
        };
        self.write_metadata(&local)?;
        Ok(local)
    }

    /// Bumps the usage counters of a local model
    pub fn mark_used(&self, model_id: &str) -> Result<()> {
        if let Some(mut local) = self.local_model(model_id) {
            local.last_used = Some(Utc::now());
            local.use_count += 1;
            self.write_metadata(&local)?;
        }
        Ok(())
    }

    fn write_metadata(&self, local: &LocalModel) -> Result<()> {
        let path = self.metadata_path(&local.model_id);
        let json = serde_json::to_string_pretty(local)
            .map_err(|e| RuntimeError::model(format!("Failed to encode model metadata: {}", e)))?;
        std::fs::write(&path, json).map_err(|e| io_error("write", &path, e))
    }

    /// Removes the artifact, its metadata and any partial transfer
    pub fn remove(&self, model_id: &str) -> Result<bool> {
        let artifact = self
            .local_model(model_id)
            .map(|local| local.artifact_path)
            .unwrap_or_else(|| self.artifact_path(model_id));

        let mut removed = false;
        for path in [
            artifact,
            self.metadata_path(model_id),
            self.partial_path(model_id),
            self.marker_path(model_id),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error("remove", &path, e)),
            }
        }
        Ok(removed)
    }

    pub fn save_marker(&self, marker: &ResumeMarker) -> Result<()> {
        let path = self.marker_path(&marker.model_id);
        let json = serde_json::to_string(marker)
            .map_err(|e| RuntimeError::model(format!("Failed to encode resume marker: {}", e)))?;
        std::fs::write(&path, json).map_err(|e| io_error("write", &path, e))
    }

    pub fn load_marker(&self, model_id: &str) -> Option<ResumeMarker> {
        let json = std::fs::read_to_string(self.marker_path(model_id)).ok()?;
        serde_json::from_str(&json).ok()
    }

    /// Drops the partial file and its marker
    pub fn discard_partial(&self, model_id: &str) -> Result<()> {
        for path in [self.partial_path(model_id), self.marker_path(model_id)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error("remove", &path, e)),
            }
        }
        Ok(())
    }

    /// Offset to resume from. A partial whose marker does not describe this
    /// descriptor is discarded; bytes past the confirmed offset are truncated.
    pub fn resume_offset(&self, descriptor: &ModelDescriptor) -> Result<u64> {
        let partial = self.partial_path(&descriptor.id);
        let partial_len = std::fs::metadata(&partial).map(|m| m.len()).ok();

        let marker = self.load_marker(&descriptor.id);
        let usable = match (&marker, partial_len) {
            (Some(marker), Some(len)) => {
                marker.checksum == descriptor.checksum
                    && marker.total_bytes == descriptor.size_bytes
                    && marker.confirmed_offset <= len
                    && marker.confirmed_offset <= descriptor.size_bytes
            }
            _ => false,
        };

        if !usable {
            if partial_len.is_some() || marker.is_some() {
                debug!("Discarding stale partial download for {}", descriptor.id);
            }
            self.discard_partial(&descriptor.id)?;
            return Ok(0);
        }

        let offset = marker.map(|m| m.confirmed_offset).unwrap_or(0);
        if partial_len != Some(offset) {
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(&partial)
                .map_err(|e| io_error("open", &partial, e))?;
            file.set_len(offset).map_err(|e| io_error("truncate", &partial, e))?;
        }
        Ok(offset)
    }
}
