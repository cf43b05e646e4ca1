use std::io;

use super::types::SandboxHandle;

/// Errors from sandbox and session operations.
///
/// Backends map their runtime errors into these variants. A command that
/// runs and exits nonzero is not an error: it is reported through
/// `ExecOutput::exit_code`. `Exec` means the environment itself could not
/// be reached.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    /// `handle` is set when a created-but-unstarted environment could not be
    /// cleaned up and still needs a `destroy`.
    #[error("provision failed: {reason}")]
    Provision {
        reason: String,
        handle: Option<SandboxHandle>,
    },

    #[error("destroy failed: {0}")]
    Destroy(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("session open failed: {0}")]
    SessionOpen(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("write to session {session_id} failed: {reason}")]
    Write { session_id: String, reason: String },

    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    #[error("record store: {0}")]
    Store(#[from] anyhow::Error),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl SandboxError {
    pub fn provision(reason: impl Into<String>) -> Self {
        Self::Provision {
            reason: reason.into(),
            handle: None,
        }
    }

    /// True for conditions the caller can recover from by fixing the id.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound(_) | Self::SandboxNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_displays_reason() {
        let err = SandboxError::provision("image pull failed");
        assert_eq!(err.to_string(), "provision failed: image pull failed");
        assert!(matches!(err, SandboxError::Provision { handle: None, .. }));
    }

    #[test]
    fn provision_can_carry_leaked_handle() {
        let err = SandboxError::Provision {
            reason: "start failed".into(),
            handle: Some(SandboxHandle::new("abc123")),
        };
        match err {
            SandboxError::Provision { handle, .. } => {
                assert_eq!(handle.unwrap().as_str(), "abc123");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn session_errors_display_id() {
        assert_eq!(
            SandboxError::SessionNotFound("s-1".into()).to_string(),
            "session not found: s-1"
        );
        assert_eq!(
            SandboxError::SessionClosed("s-1".into()).to_string(),
            "session closed: s-1"
        );
        let err = SandboxError::Write {
            session_id: "s-1".into(),
            reason: "broken pipe".into(),
        };
        assert_eq!(err.to_string(), "write to session s-1 failed: broken pipe");
    }

    #[test]
    fn not_found_classification() {
        assert!(SandboxError::SessionNotFound("x".into()).is_not_found());
        assert!(SandboxError::SandboxNotFound("x".into()).is_not_found());
        assert!(!SandboxError::Exec("x".into()).is_not_found());
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "ignite missing");
        let err: SandboxError = io_err.into();
        assert!(matches!(err, SandboxError::Io(_)));
        assert!(err.to_string().contains("ignite missing"));
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SandboxError>();
    }
}
