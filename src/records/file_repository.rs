use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::repository::SandboxRepository;
use super::{RecordStatus, SandboxRecord};
use crate::sandbox::{BackendKind, SandboxHandle};

/// Sandbox records kept in memory and mirrored to one JSON file each under
/// `<data_dir>/sandboxes/`. Deleted records stay on disk with their status
/// flipped.
pub struct FileSandboxRepository {
    records: RwLock<HashMap<String, SandboxRecord>>,
    dir: PathBuf,
}

impl FileSandboxRepository {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            dir: base_dir.as_ref().join("sandboxes"),
        }
    }

    fn persist(&self, record: &SandboxRecord) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.dir.join(format!("{}.json", record.id));
        let content = serde_json::to_string_pretty(record)?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl SandboxRepository for FileSandboxRepository {
    async fn save(&self, handle: SandboxHandle, backend: BackendKind) -> Result<SandboxRecord> {
        let record = SandboxRecord::new(handle, backend);
        self.persist(&record)?;
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        tracing::debug!(record_id = %record.id, sandbox = %record.handle, "sandbox record saved");
        Ok(record)
    }

    async fn find(&self, id: &str) -> Option<SandboxRecord> {
        self.records
            .read()
            .await
            .get(id)
            .filter(|r| r.is_active())
            .cloned()
    }

    async fn mark_deleted(&self, id: &str) -> Result<bool> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(id).filter(|r| r.is_active()) else {
            return Ok(false);
        };
        let mut updated = record.clone();
        updated.status = RecordStatus::Deleted;
        updated.deleted_at = Some(Utc::now());
        self.persist(&updated)?;
        *record = updated;
        Ok(true)
    }

    async fn list_active(&self) -> Vec<SandboxRecord> {
        let mut active: Vec<SandboxRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        active
    }

    async fn load_all(&self) -> Result<()> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)?;
            return Ok(());
        }

        let mut map = HashMap::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<SandboxRecord>(&content) {
                    Ok(record) => {
                        map.insert(record.id.clone(), record);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to parse sandbox record");
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to read sandbox record");
                }
            }
        }

        let active = map.values().filter(|r| r.is_active()).count();
        tracing::info!(count = map.len(), active, "loaded sandbox records");
        *self.records.write().await = map;
        Ok(())
    }
}
