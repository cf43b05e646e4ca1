//! Orchestration of sandbox lifecycle over one configured backend.

use std::sync::Arc;

use crate::records::{SandboxRecord, SandboxRepository};
use crate::sandbox::{BackendAdapter, BackendKind, ExecOutput, SandboxError};
use crate::sessions::{EventStream, SessionId, SessionRegistry, StreamingGateway};

/// The inbound operation set: provision, destroy, run, and the session
/// operations. Sandboxes are addressed by record id; the backend handle
/// never leaves this layer.
pub struct SandboxSupervisor {
    adapter: Arc<dyn BackendAdapter>,
    registry: Arc<SessionRegistry>,
    gateway: StreamingGateway,
    records: Arc<dyn SandboxRepository>,
}

impl SandboxSupervisor {
    pub fn new(adapter: Arc<dyn BackendAdapter>, records: Arc<dyn SandboxRepository>) -> Self {
        let registry = Arc::new(SessionRegistry::new(adapter.clone()));
        let gateway = StreamingGateway::new(registry.clone());
        Self {
            adapter,
            registry,
            gateway,
            records,
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.adapter.kind()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    async fn resolve(&self, record_id: &str) -> Result<SandboxRecord, SandboxError> {
        self.records
            .find(record_id)
            .await
            .ok_or_else(|| SandboxError::SandboxNotFound(record_id.to_string()))
    }

    pub async fn provision_sandbox(&self) -> Result<SandboxRecord, SandboxError> {
        let handle = match self.adapter.provision().await {
            Ok(handle) => handle,
            Err(e) => {
                if let SandboxError::Provision {
                    handle: Some(leaked),
                    ..
                } = &e
                {
                    tracing::warn!(sandbox = %leaked, "provision failed and left an environment behind");
                }
                return Err(e);
            }
        };

        match self.records.save(handle.clone(), self.adapter.kind()).await {
            Ok(record) => {
                tracing::info!(
                    record_id = %record.id,
                    sandbox = %handle,
                    backend = %record.backend,
                    "sandbox provisioned"
                );
                Ok(record)
            }
            Err(e) => {
                if let Err(cleanup) = self.adapter.destroy(&handle).await {
                    tracing::warn!(sandbox = %handle, error = %cleanup, "cleanup after failed save");
                }
                Err(SandboxError::Store(e))
            }
        }
    }

    pub async fn list_sandboxes(&self) -> Vec<SandboxRecord> {
        self.records.list_active().await
    }

    /// Tear down the environment and every session bound to it.
    ///
    /// The record is released even when the backend reports a destroy
    /// failure; that failure is still returned.
    pub async fn destroy_sandbox(&self, record_id: &str) -> Result<(), SandboxError> {
        let record = self.resolve(record_id).await?;

        let sessions = self.registry.remove_for_sandbox(&record.handle).await;
        let destroyed = self.adapter.destroy(&record.handle).await;
        self.records.mark_deleted(record_id).await?;

        match &destroyed {
            Ok(()) => tracing::info!(
                record_id = %record_id,
                sandbox = %record.handle,
                sessions,
                "sandbox destroyed"
            ),
            Err(e) => tracing::warn!(
                record_id = %record_id,
                sandbox = %record.handle,
                error = %e,
                "sandbox released with destroy error"
            ),
        }
        destroyed
    }

    pub async fn run_command(
        &self,
        record_id: &str,
        command: &str,
    ) -> Result<ExecOutput, SandboxError> {
        let record = self.resolve(record_id).await?;
        let output = self.adapter.run_once(&record.handle, command).await?;
        tracing::debug!(
            record_id = %record_id,
            exit_code = output.exit_code,
            "command finished"
        );
        Ok(output)
    }

    pub async fn open_session(&self, record_id: &str) -> Result<SessionId, SandboxError> {
        let record = self.resolve(record_id).await?;
        self.registry.create(&record.handle).await
    }

    pub async fn write_session(&self, session_id: &str, text: &str) -> Result<(), SandboxError> {
        self.registry.write(session_id, text).await
    }

    /// Idempotent; completion is observed through the stream's `end` event.
    pub async fn close_session(&self, session_id: &str) {
        self.registry.remove(session_id).await;
    }

    pub async fn attach_stream(&self, session_id: &str) -> Result<EventStream, SandboxError> {
        self.gateway.attach(session_id).await
    }

    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }
}
