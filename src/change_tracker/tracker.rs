//! Per-VM export history used to decide incremental-export eligibility
//! (spec §4.7).
//!
//! Persists one JSON file per export under `base_dir/<vm_id>/`, with a
//! `latest` symlink pointing at the newest one. Reading `latest` first
//! avoids a directory scan on the common path; when the symlink can't be
//! created or read (unsupported filesystem, concurrent writer raced it
//! away), falls back to scanning the directory for the file with the
//! newest mtime (spec §9 open question, resolved).

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Utc;
use tracing::warn;

use crate::error::{CoreError, Result};

use super::model::ExportMetadata;

pub struct ChangeTracker {
    base_dir: PathBuf,
}

impl ChangeTracker {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn vm_dir(&self, vm_id: &str) -> PathBuf {
        self.base_dir.join(vm_id)
    }

    pub async fn record_export(&self, metadata: &ExportMetadata) -> Result<()> {
        let dir = self.vm_dir(&metadata.vm_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CoreError::Store(e.into()))?;

        let filename = format!("{}.json", metadata.exported_at.timestamp_millis());
        let path = dir.join(&filename);
        let json = serde_json::to_vec_pretty(metadata).map_err(|e| CoreError::Validation(e.to_string()))?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| CoreError::Store(e.into()))?;

        let latest_link = dir.join("latest");
        let _ = tokio::fs::remove_file(&latest_link).await;
        #[cfg(unix)]
        {
            if let Err(e) = tokio::fs::symlink(&filename, &latest_link).await {
                warn!(vm_id = %metadata.vm_id, error = %e, "failed to refresh latest symlink, will fall back to mtime scan");
            }
        }
        Ok(())
    }

    pub async fn latest_export(&self, vm_id: &str) -> Result<Option<ExportMetadata>> {
        let dir = self.vm_dir(vm_id);
        if tokio::fs::metadata(&dir).await.is_err() {
            return Ok(None);
        }

        let latest_link = dir.join("latest");
        if let Ok(data) = tokio::fs::read(&latest_link).await {
            if let Ok(metadata) = serde_json::from_slice::<ExportMetadata>(&data) {
                return Ok(Some(metadata));
            }
        }

        self.latest_by_mtime_scan(&dir).await
    }

    async fn latest_by_mtime_scan(&self, dir: &Path) -> Result<Option<ExportMetadata>> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| CoreError::Store(e.into()))?;
        let mut best: Option<(SystemTime, PathBuf)> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CoreError::Store(e.into()))?
        {
            let path = entry.path();
            if path.file_name().map(|n| n == "latest").unwrap_or(false) {
                continue;
            }
            if path.extension().map(|ext| ext != "json").unwrap_or(true) {
                continue;
            }
            let meta = entry.metadata().await.map_err(|e| CoreError::Store(e.into()))?;
            let modified = meta.modified().map_err(|e| CoreError::Store(e.into()))?;
            if best.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
                best = Some((modified, path));
            }
        }

        match best {
            Some((_, path)) => {
                let data = tokio::fs::read(&path).await.map_err(|e| CoreError::Store(e.into()))?;
                let metadata = serde_json::from_slice(&data).map_err(|e| CoreError::Validation(e.to_string()))?;
                Ok(Some(metadata))
            }
            None => Ok(None),
        }
    }

    /// Incremental export is only possible when the latest recorded
    /// export (a) happened within the last 7 days, (b) covered exactly
    /// the same set of disk keys as `current_disk_keys`, and (c) recorded
    /// a non-empty change id for every one of them. Any missing history,
    /// mismatched disk set, or blank change id conservatively disqualifies
    /// it rather than risk a wrong incremental.
    pub async fn is_incremental_possible(&self, vm_id: &str, current_disk_keys: &[String]) -> Result<bool> {
        let Some(latest) = self.latest_export(vm_id).await? else {
            return Ok(false);
        };

        if Utc::now() - latest.exported_at > chrono::Duration::days(7) {
            return Ok(false);
        }

        let recorded: std::collections::BTreeSet<&String> = latest.disk_change_ids.keys().collect();
        let current: std::collections::BTreeSet<&String> = current_disk_keys.iter().collect();
        if recorded != current {
            return Ok(false);
        }

        Ok(latest.disk_change_ids.values().all(|id| !id.is_empty()))
    }
}
