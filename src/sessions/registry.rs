use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::sandbox::{
    BackendAdapter, OutputEvent, OutputSource, SandboxError, SandboxHandle, SessionChannel,
};

pub type SessionId = String;

/// How many removed ids are remembered so that writes to them report
/// `SessionClosed` rather than `SessionNotFound`.
const CLOSED_WINDOW: usize = 1024;

/// One live interactive shell.
pub struct Session {
    id: SessionId,
    sandbox: SandboxHandle,
    channel: Box<dyn SessionChannel>,
    output: OutputSource,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sandbox(&self) -> &SandboxHandle {
        &self.sandbox
    }

    pub fn output(&self) -> &OutputSource {
        &self.output
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Default)]
struct Entries {
    live: HashMap<SessionId, Arc<Session>>,
    closed_order: VecDeque<SessionId>,
    closed: HashSet<SessionId>,
}

impl Entries {
    fn take(&mut self, id: &str) -> Option<Arc<Session>> {
        let session = self.live.remove(id)?;
        self.closed_order.push_back(session.id.clone());
        self.closed.insert(session.id.clone());
        while self.closed_order.len() > CLOSED_WINDOW {
            if let Some(oldest) = self.closed_order.pop_front() {
                self.closed.remove(&oldest);
            }
        }
        Some(session)
    }
}

/// Process-wide table of live sessions.
///
/// Created once at startup and shared by reference. Every entry is removed
/// either explicitly (`remove`, `remove_for_sandbox`) or by its watcher task
/// once the session's output source ends. Ids are v4 UUIDs and are never
/// reissued.
pub struct SessionRegistry {
    adapter: Arc<dyn BackendAdapter>,
    entries: Arc<RwLock<Entries>>,
}

impl SessionRegistry {
    pub fn new(adapter: Arc<dyn BackendAdapter>) -> Self {
        Self {
            adapter,
            entries: Arc::new(RwLock::new(Entries::default())),
        }
    }

    /// Open a shell on `sandbox` and register it under a fresh id.
    pub async fn create(&self, sandbox: &SandboxHandle) -> Result<SessionId, SandboxError> {
        let opened = self.adapter.open_session(sandbox).await?;
        let id = uuid::Uuid::new_v4().to_string();

        let session = Arc::new(Session {
            id: id.clone(),
            sandbox: sandbox.clone(),
            channel: opened.channel,
            output: opened.output,
            created_at: Utc::now(),
        });

        // Subscribed before the id is visible so an early End is not missed.
        let mut watcher = session.output.subscribe();
        let total = {
            let mut entries = self.entries.write().await;
            entries.live.insert(id.clone(), session);
            entries.live.len()
        };

        let entries = self.entries.clone();
        let watched_id = id.clone();
        tokio::spawn(async move {
            while let Some(event) = watcher.recv().await {
                if event == OutputEvent::End {
                    break;
                }
            }
            let removed = entries.write().await.take(&watched_id);
            if let Some(session) = removed {
                tracing::info!(session_id = %watched_id, "session ended, removing");
                session.channel.close().await;
            }
        });

        tracing::info!(
            session_id = %id,
            sandbox = %sandbox,
            active_sessions = total,
            "session registered"
        );
        Ok(id)
    }

    pub async fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.entries.read().await.live.get(id).cloned()
    }

    /// Send one line of input. A trailing newline is appended.
    pub async fn write(&self, id: &str, text: &str) -> Result<(), SandboxError> {
        let session = {
            let entries = self.entries.read().await;
            match entries.live.get(id) {
                Some(session) => session.clone(),
                None if entries.closed.contains(id) => {
                    return Err(SandboxError::SessionClosed(id.to_string()));
                }
                None => return Err(SandboxError::SessionNotFound(id.to_string())),
            }
        };

        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');

        match session.channel.write(line.as_bytes()).await {
            Ok(()) => {
                tracing::debug!(session_id = %id, bytes = line.len(), "input written");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "session write failed");
                if matches!(e, SandboxError::SessionClosed(_)) || session.channel.is_closed() {
                    self.remove(id).await;
                }
                Err(SandboxError::Write {
                    session_id: id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Close the channel and drop the entry. Unknown ids are a no-op.
    pub async fn remove(&self, id: &str) {
        let removed = self.entries.write().await.take(id);
        if let Some(session) = removed {
            session.channel.close().await;
            let age_secs = (Utc::now() - session.created_at()).num_seconds();
            tracing::info!(
                session_id = %id,
                sandbox = %session.sandbox,
                age_secs,
                "session removed"
            );
        }
    }

    /// Remove every session bound to `sandbox`. Returns how many were removed.
    pub async fn remove_for_sandbox(&self, sandbox: &SandboxHandle) -> usize {
        let removed: Vec<Arc<Session>> = {
            let mut entries = self.entries.write().await;
            let ids: Vec<SessionId> = entries
                .live
                .values()
                .filter(|s| &s.sandbox == sandbox)
                .map(|s| s.id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.take(id)).collect()
        };

        for session in &removed {
            session.channel.close().await;
        }
        if !removed.is_empty() {
            tracing::info!(sandbox = %sandbox, count = removed.len(), "sessions removed for sandbox");
        }
        removed.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close every session; used on shutdown.
    pub async fn close_all(&self) {
        let removed: Vec<Arc<Session>> = {
            let mut entries = self.entries.write().await;
            let ids: Vec<SessionId> = entries.live.keys().cloned().collect();
            ids.iter().filter_map(|id| entries.take(id)).collect()
        };
        for session in &removed {
            session.channel.close().await;
        }
        tracing::info!(count = removed.len(), "closed all sessions");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::sandbox::testing::ScriptedAdapter;

    async fn setup() -> (Arc<ScriptedAdapter>, SessionRegistry, SandboxHandle) {
        let adapter = Arc::new(ScriptedAdapter::new());
        let handle = adapter.provision().await.unwrap();
        let registry = SessionRegistry::new(adapter.clone());
        (adapter, registry, handle)
    }

    async fn eventually_gone(registry: &SessionRegistry, id: &str) -> bool {
        for _ in 0..100 {
            if registry.lookup(id).await.is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn create_then_lookup_returns_bound_session() {
        let (_adapter, registry, handle) = setup().await;
        let id = registry.create(&handle).await.unwrap();

        let session = registry.lookup(&id).await.unwrap();
        assert_eq!(session.id(), id);
        assert_eq!(session.sandbox(), &handle);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let (_adapter, registry, handle) = setup().await;
        let a = registry.create(&handle).await.unwrap();
        let b = registry.create(&handle).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn create_on_unknown_sandbox_fails() {
        let (_adapter, registry, _handle) = setup().await;
        let err = registry
            .create(&SandboxHandle::new("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::SessionOpen(_)));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn never_issued_ids_are_not_found_and_harmless() {
        let (_adapter, registry, _handle) = setup().await;
        assert!(registry.lookup("nope").await.is_none());
        assert!(matches!(
            registry.write("nope", "ls").await,
            Err(SandboxError::SessionNotFound(_))
        ));
        registry.remove("nope").await;
    }

    #[tokio::test]
    async fn write_appends_newline_and_reaches_shell() {
        let (_adapter, registry, handle) = setup().await;
        let id = registry.create(&handle).await.unwrap();
        let mut sub = registry.lookup(&id).await.unwrap().output().subscribe();

        registry.write(&id, "echo 42").await.unwrap();

        match sub.recv().await {
            Some(OutputEvent::Chunk(text)) => assert!(text.contains("42")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_write_after_reports_closed() {
        let (_adapter, registry, handle) = setup().await;
        let id = registry.create(&handle).await.unwrap();

        registry.remove(&id).await;
        registry.remove(&id).await;

        assert!(registry.lookup(&id).await.is_none());
        assert!(matches!(
            registry.write(&id, "ls").await,
            Err(SandboxError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn removal_ends_attached_subscribers() {
        let (_adapter, registry, handle) = setup().await;
        let id = registry.create(&handle).await.unwrap();
        let mut sub = registry.lookup(&id).await.unwrap().output().subscribe();

        registry.remove(&id).await;

        assert_eq!(sub.recv().await, Some(OutputEvent::End));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn ended_session_is_removed_implicitly() {
        let (adapter, registry, handle) = setup().await;
        let id = registry.create(&handle).await.unwrap();
        let mut sub = registry.lookup(&id).await.unwrap().output().subscribe();

        adapter.end_sessions(&handle);

        assert_eq!(sub.recv().await, Some(OutputEvent::End));
        assert_eq!(sub.recv().await, None);
        assert!(eventually_gone(&registry, &id).await);
    }

    #[tokio::test]
    async fn failed_channel_write_is_write_error_and_drops_entry() {
        let (adapter, registry, handle) = setup().await;
        let id = registry.create(&handle).await.unwrap();

        // The shell is gone but the watcher task has not run yet on this
        // single-threaded runtime, so the entry is still registered.
        adapter.end_sessions(&handle);
        assert!(registry.lookup(&id).await.is_some());

        match registry.write(&id, "ls").await {
            Err(SandboxError::Write { session_id, .. }) => assert_eq!(session_id, id),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(registry.lookup(&id).await.is_none());
    }

    #[tokio::test]
    async fn shell_exit_through_input_removes_entry() {
        let (_adapter, registry, handle) = setup().await;
        let id = registry.create(&handle).await.unwrap();

        registry.write(&id, "exit").await.unwrap();

        assert!(eventually_gone(&registry, &id).await);
    }

    #[tokio::test]
    async fn remove_for_sandbox_only_touches_that_sandbox() {
        let (adapter, registry, handle) = setup().await;
        let other = adapter.provision().await.unwrap();
        let a = registry.create(&handle).await.unwrap();
        let b = registry.create(&handle).await.unwrap();
        let c = registry.create(&other).await.unwrap();

        assert_eq!(registry.remove_for_sandbox(&handle).await, 2);

        assert!(registry.lookup(&a).await.is_none());
        assert!(registry.lookup(&b).await.is_none());
        assert!(registry.lookup(&c).await.is_some());
    }

    #[tokio::test]
    async fn closed_window_is_bounded() {
        let adapter = ScriptedAdapter::new();
        let sandbox = adapter.provision().await.unwrap();
        let mut entries = Entries::default();
        for i in 0..(CLOSED_WINDOW + 10) {
            let opened = adapter.open_session(&sandbox).await.unwrap();
            let id = format!("s-{i}");
            entries.live.insert(
                id.clone(),
                Arc::new(Session {
                    id: id.clone(),
                    sandbox: sandbox.clone(),
                    channel: opened.channel,
                    output: opened.output,
                    created_at: Utc::now(),
                }),
            );
            entries.take(&id);
        }
        assert_eq!(entries.closed.len(), CLOSED_WINDOW);
        assert!(!entries.closed.contains("s-0"));
        assert!(entries.closed.contains(&format!("s-{}", CLOSED_WINDOW + 9)));
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let (_adapter, registry, handle) = setup().await;
        registry.create(&handle).await.unwrap();
        registry.create(&handle).await.unwrap();

        registry.close_all().await;
        assert!(registry.is_empty().await);
    }
}
