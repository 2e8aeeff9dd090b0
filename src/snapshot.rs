// ABOUTME: Snapshot store - persists the last-known appointment set as a JSON document
// ABOUTME: Saves atomically via temp file, read-back verification and backup restore

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{SyncError, SyncResult};
use crate::record::{Record, Snapshot};

/// Document written to disk and consumed by the client application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDocument {
    /// When the snapshot was captured
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Records as flat objects in source order
    pub appointments: Vec<Record>,
    pub total_count: usize,
    #[serde(default)]
    pub sync_info: SyncInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncInfo {
    /// Source description (sanitized - no password)
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub tool_version: String,
}

impl SnapshotDocument {
    pub fn from_snapshot(snapshot: &Snapshot, source: &str) -> Self {
        Self {
            timestamp: snapshot.captured_at,
            appointments: snapshot.records().to_vec(),
            total_count: snapshot.len(),
            sync_info: SyncInfo {
                source: crate::utils::sanitize_url(source),
                tool_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    pub fn into_snapshot(self) -> Snapshot {
        let (snapshot, issues) = Snapshot::from_records(self.appointments);
        for issue in issues {
            tracing::warn!("Stored snapshot: {}", issue);
        }
        snapshot.with_captured_at(self.timestamp)
    }
}

/// Holds exactly one previous snapshot on disk.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
    keep_backup: bool,
    source: String,
    #[cfg(test)]
    corrupt_installed: bool,
}

impl SnapshotStore {
    /// Create a store for the given file.
    ///
    /// `source` is recorded in the document's `sync_info` (password masked).
    pub fn new(path: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            keep_backup: false,
            source: source.into(),
            #[cfg(test)]
            corrupt_installed: false,
        }
    }

    /// Keep `<file>.backup` (the previous snapshot) after a successful save.
    pub fn keep_backup(mut self, keep: bool) -> Self {
        self.keep_backup = keep;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        with_suffix(&self.path, ".backup")
    }

    fn temp_path(&self) -> PathBuf {
        with_suffix(&self.path, ".tmp")
    }

    /// Load the previous snapshot; an absent file yields an empty snapshot.
    pub async fn load(&self) -> SyncResult<Snapshot> {
        match self.load_document().await? {
            Some(doc) => {
                let snapshot = doc.into_snapshot();
                tracing::info!(
                    "Loaded previous snapshot from {:?}: {} records",
                    self.path,
                    snapshot.len()
                );
                Ok(snapshot)
            }
            None => {
                tracing::info!("No previous snapshot at {:?}, starting empty", self.path);
                Ok(Snapshot::empty())
            }
        }
    }

    /// Load the raw document, `None` if the file does not exist.
    pub async fn load_document(&self) -> SyncResult<Option<SnapshotDocument>> {
        if !exists(&self.path).await? {
            return Ok(None);
        }
        read_document(&self.path).await.map(Some)
    }

    /// Persist a snapshot atomically.
    ///
    /// The new document is written to `<file>.tmp` and verified by reading it
    /// back. Only then is the current file copied to `<file>.backup` and the
    /// temp file renamed over it. If the final verification fails the backup is
    /// restored and a persistence error returned, so the file on disk is always
    /// either the old or the new complete snapshot.
    pub async fn save(&self, snapshot: &Snapshot) -> SyncResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    SyncError::Persistence(format!("failed to create directory {:?}: {}", parent, e))
                })?;
            }
        }

        let doc = SnapshotDocument::from_snapshot(snapshot, &self.source);
        let contents = serde_json::to_vec_pretty(&doc)
            .map_err(|e| SyncError::Persistence(format!("failed to serialize snapshot: {}", e)))?;

        let temp = self.temp_path();
        if let Err(e) = write_synced(&temp, &contents).await {
            let _ = fs::remove_file(&temp).await;
            return Err(SyncError::Persistence(format!(
                "failed to write {:?}: {}",
                temp, e
            )));
        }

        if let Err(e) = verify(&temp, snapshot.len()).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e);
        }

        let backup = self.backup_path();
        let had_previous = match exists(&self.path).await {
            Ok(found) => found,
            Err(e) => {
                let _ = fs::remove_file(&temp).await;
                return Err(e);
            }
        };
        if had_previous {
            // Copy, so the live file stays in place until the rename replaces it
            if let Err(e) = fs::copy(&self.path, &backup).await {
                let _ = fs::remove_file(&temp).await;
                return Err(SyncError::Persistence(format!(
                    "failed to create backup {:?}: {}",
                    backup, e
                )));
            }
            tracing::debug!("Backup created: {:?}", backup);
        }

        let installed = match fs::rename(&temp, &self.path).await {
            Ok(()) => {
                #[cfg(test)]
                if self.corrupt_installed {
                    let _ = fs::write(&self.path, b"{").await;
                }
                verify(&self.path, snapshot.len()).await
            }
            Err(e) => {
                let _ = fs::remove_file(&temp).await;
                Err(SyncError::Persistence(format!(
                    "failed to move {:?} into place: {}",
                    temp, e
                )))
            }
        };

        if let Err(e) = installed {
            tracing::error!("Snapshot save failed: {}", e);
            if had_previous {
                match fs::rename(&backup, &self.path).await {
                    Ok(()) => tracing::warn!("Snapshot restored from backup {:?}", backup),
                    Err(restore) => tracing::error!(
                        "Failed to restore snapshot from backup {:?}: {}",
                        backup,
                        restore
                    ),
                }
            } else {
                let _ = fs::remove_file(&self.path).await;
            }
            return Err(e);
        }

        if had_previous && !self.keep_backup {
            if let Err(e) = fs::remove_file(&backup).await {
                tracing::warn!("Failed to remove backup {:?}: {}", backup, e);
            }
        }

        tracing::info!(
            "Snapshot saved to {:?}: {} records (integrity verified)",
            self.path,
            snapshot.len()
        );
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

async fn exists(path: &Path) -> SyncResult<bool> {
    fs::try_exists(path)
        .await
        .map_err(|e| SyncError::Persistence(format!("failed to check {:?}: {}", path, e)))
}

async fn write_synced(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    Ok(())
}

async fn read_document(path: &Path) -> SyncResult<SnapshotDocument> {
    let contents = fs::read_to_string(path)
        .await
        .map_err(|e| SyncError::Persistence(format!("failed to read {:?}: {}", path, e)))?;
    serde_json::from_str(&contents)
        .map_err(|e| SyncError::Persistence(format!("failed to parse {:?}: {}", path, e)))
}

/// Read a written document back and check its record counts.
async fn verify(path: &Path, expected: usize) -> SyncResult<()> {
    let doc = read_document(path).await?;
    if doc.appointments.len() != expected || doc.total_count != expected {
        return Err(SyncError::Persistence(format!(
            "integrity check failed for {:?}: expected {} records, found {} (total_count {})",
            path,
            expected,
            doc.appointments.len(),
            doc.total_count
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn snapshot(ids: &[&str]) -> Snapshot {
        let records = ids.iter().map(|id| {
            let mut fields = BTreeMap::new();
            fields.insert("Hora".to_string(), "09:00".to_string());
            Record::new(*id, "t1", "t1", fields).unwrap()
        });
        Snapshot::from_records(records).0
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("missing.json"), "clinic.db");
        let loaded = store.load().await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("nested/appointments.json"), "clinic.db");
        let snap = snapshot(&["1", "2", "3"]);

        store.save(&snap).await.unwrap();
        let loaded = store.load().await.unwrap();

        assert_eq!(loaded, snap);
        assert_eq!(loaded.ids().collect::<Vec<_>>(), vec!["1", "2", "3"]);
        assert!(!store.temp_path().exists());
        assert!(!store.backup_path().exists());
    }

    #[tokio::test]
    async fn test_save_keeps_backup_when_requested() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("appointments.json"), "clinic.db")
            .keep_backup(true);

        store.save(&snapshot(&["1"])).await.unwrap();
        store.save(&snapshot(&["1", "2"])).await.unwrap();

        let backup = read_document(&store.backup_path()).await.unwrap();
        assert_eq!(backup.total_count, 1);
        assert_eq!(store.load().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_install_restores_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("appointments.json");
        let store = SnapshotStore::new(&path, "clinic.db");
        store.save(&snapshot(&["1"])).await.unwrap();

        let mut broken = store.clone();
        broken.corrupt_installed = true;
        let err = broken.save(&snapshot(&["1", "2"])).await.unwrap_err();

        assert!(matches!(err, SyncError::Persistence(_)));
        assert_eq!(store.load().await.unwrap().ids().collect::<Vec<_>>(), vec!["1"]);
        assert!(!store.temp_path().exists());
        assert!(!store.backup_path().exists());
    }

    #[tokio::test]
    async fn test_first_save_failing_install_leaves_nothing() {
        let dir = tempdir().unwrap();
        let mut store = SnapshotStore::new(dir.path().join("appointments.json"), "clinic.db");
        store.corrupt_installed = true;

        assert!(store.save(&snapshot(&["1"])).await.is_err());
        assert!(!store.path().exists());
        assert!(!store.backup_path().exists());
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_location_is_an_error() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("plain");
        std::fs::write(&plain, "not a directory").unwrap();
        let store = SnapshotStore::new(plain.join("appointments.json"), "clinic.db");

        assert!(matches!(
            store.load().await,
            Err(SyncError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn test_document_shape() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("appointments.json");
        let store = SnapshotStore::new(&path, "postgresql://clinic:secret@db/gelite");
        store.save(&snapshot(&["7"])).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["total_count"], 1);
        assert_eq!(raw["appointments"][0]["Registro"], "7");
        assert_eq!(raw["appointments"][0]["Hora"], "09:00");
        assert!(raw["sync_info"]["source"].as_str().unwrap().contains("***"));
        assert!(raw["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("appointments.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = SnapshotStore::new(&path, "clinic.db");
        assert!(matches!(
            store.load().await,
            Err(SyncError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn test_loads_legacy_numeric_ids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("appointments.json");
        std::fs::write(
            &path,
            r#"{"timestamp":"2025-01-01T10:00:00Z","appointments":[{"Registro":15,"FechaAlta":"a","CitMod":"a"}],"total_count":1}"#,
        )
        .unwrap();
        let store = SnapshotStore::new(&path, "clinic.db");
        let loaded = store.load().await.unwrap();
        assert!(loaded.contains("15"));
    }
}
