pub mod adapter;
pub mod backends;
pub mod error;
pub mod host_command;
pub mod output;
pub mod sanitize;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

pub use adapter::{BackendAdapter, OpenedSession, SessionChannel};
pub use error::SandboxError;
pub use output::{OutputEvent, OutputSource, Subscription};
pub use types::*;

use backends::container::ContainerAdapter;
use backends::microvm::MicroVmAdapter;

/// Build the backend adapter selected by runtime config.
pub fn build_adapter(
    config: SandboxRuntimeConfig,
) -> Result<Arc<dyn BackendAdapter>, SandboxError> {
    match config {
        SandboxRuntimeConfig::Container(c) => {
            tracing::info!(image = %c.image, "initializing container backend");
            Ok(Arc::new(ContainerAdapter::new(c)?))
        }
        SandboxRuntimeConfig::MicroVm(c) => {
            tracing::info!(
                image = %c.image,
                ignite = %c.ignite_bin.display(),
                "initializing micro-VM backend"
            );
            Ok(Arc::new(MicroVmAdapter::new(c)))
        }
    }
}
