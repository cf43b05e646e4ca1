use anyhow::Result;
use async_trait::async_trait;

use super::SandboxRecord;
use crate::sandbox::{BackendKind, SandboxHandle};

#[async_trait]
pub trait SandboxRepository: Send + Sync {
    /// Store a new active record for `handle` and return it.
    async fn save(&self, handle: SandboxHandle, backend: BackendKind) -> Result<SandboxRecord>;
    /// Active records only; deleted ones read as absent.
    async fn find(&self, id: &str) -> Option<SandboxRecord>;
    /// Returns false when no active record had this id.
    async fn mark_deleted(&self, id: &str) -> Result<bool>;
    /// Newest first.
    async fn list_active(&self) -> Vec<SandboxRecord>;
    async fn load_all(&self) -> Result<()>;
}
