pub mod file_repository;
pub mod repository;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sandbox::{BackendKind, SandboxHandle};

pub use file_repository::FileSandboxRepository;
pub use repository::SandboxRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Active,
    Deleted,
}

/// Metadata of one provisioned sandbox, keyed by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRecord {
    pub id: String,
    pub handle: SandboxHandle,
    pub backend: BackendKind,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SandboxRecord {
    pub fn new(handle: SandboxHandle, backend: BackendKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            handle,
            backend,
            status: RecordStatus::Active,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == RecordStatus::Active
    }
}
