//! Per-viewer event streams over a session's output.
//!
//! Each `attach` yields `connected`, then one `output` per chunk, then a
//! single `end` once the session terminates. Dropping the stream detaches
//! the viewer and leaves the session and other viewers untouched.

use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::registry::SessionRegistry;
use crate::sandbox::{OutputEvent, SandboxError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Connected,
    Output { data: String },
    End,
}

pub type EventStream = BoxStream<'static, StreamEvent>;

pub struct StreamingGateway {
    registry: Arc<SessionRegistry>,
}

impl StreamingGateway {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Subscribe a new viewer to `session_id`.
    ///
    /// Fails with `SessionNotFound` before any event is produced. Chunks
    /// emitted before this call are not replayed.
    pub async fn attach(&self, session_id: &str) -> Result<EventStream, SandboxError> {
        let session = self
            .registry
            .lookup(session_id)
            .await
            .ok_or_else(|| SandboxError::SessionNotFound(session_id.to_string()))?;

        let mut subscription = session.output().subscribe();
        let viewer_of = session_id.to_string();
        tracing::debug!(
            session_id = %viewer_of,
            viewers = session.output().subscriber_count(),
            "viewer attached"
        );

        Ok(Box::pin(async_stream::stream! {
            yield StreamEvent::Connected;
            while let Some(event) = subscription.recv().await {
                match event {
                    OutputEvent::Chunk(data) => yield StreamEvent::Output { data },
                    OutputEvent::End => {
                        yield StreamEvent::End;
                        break;
                    }
                }
            }
            tracing::debug!(session_id = %viewer_of, "viewer stream finished");
        }))
    }
}
