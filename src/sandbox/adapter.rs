use async_trait::async_trait;

use super::error::SandboxError;
use super::output::OutputSource;
use super::types::{BackendKind, ExecOutput, SandboxHandle};

/// Lifecycle and I/O over one isolation technology.
///
/// One adapter instance is built from configuration at startup and shared by
/// the supervisor and the session registry. Handles created by one adapter
/// are never passed to another.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Verify the runtime is reachable (daemon ping, binary present).
    async fn health_check(&self) -> Result<(), SandboxError>;

    /// Create and start a fresh environment from the base image.
    async fn provision(&self) -> Result<SandboxHandle, SandboxError>;

    /// Stop and remove the environment. The handle is released even on error.
    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    /// Run one command to completion. Nonzero exit is reported in the output.
    async fn run_once(
        &self,
        handle: &SandboxHandle,
        command: &str,
    ) -> Result<ExecOutput, SandboxError>;

    /// Open an interactive shell. The returned source is already wired to the
    /// reader: every chunk it emits is sanitized and non-empty, and it ends
    /// exactly once.
    async fn open_session(&self, handle: &SandboxHandle) -> Result<OpenedSession, SandboxError>;
}

/// Write side of an interactive shell.
#[async_trait]
pub trait SessionChannel: Send + Sync {
    /// Write raw bytes. Fails with `SessionClosed` after `close`.
    async fn write(&self, data: &[u8]) -> Result<(), SandboxError>;

    /// Release the underlying I/O handle without waiting for the shell to
    /// exit. The output source ends asynchronously. Closing twice is a no-op.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

pub struct OpenedSession {
    pub channel: Box<dyn SessionChannel>,
    pub output: OutputSource,
}
