//! In-process backend for exercising the registry, gateway and supervisor
//! without Docker or ignite. Behaves like a tiny shell: echoes each input
//! line behind a prompt with terminal noise and answers `echo X` with `X`.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;

use super::adapter::{BackendAdapter, OpenedSession, SessionChannel};
use super::error::SandboxError;
use super::output::{self, OutputSink};
use super::sanitize::sanitize;
use super::types::{BackendKind, ExecOutput, SandboxHandle};

#[derive(Default)]
pub(crate) struct ScriptedAdapter {
    counter: AtomicU64,
    live: Mutex<HashSet<SandboxHandle>>,
    sessions: Mutex<Vec<(SandboxHandle, OutputSink)>>,
    pub fail_destroy: AtomicBool,
    pub fail_provision: AtomicBool,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_live(&self, handle: &SandboxHandle) -> bool {
        self.live.lock().unwrap().contains(handle)
    }

    /// Push raw terminal bytes to every open session on `handle`.
    pub fn push_output(&self, handle: &SandboxHandle, raw: &[u8]) {
        let text = sanitize(raw);
        for (h, sink) in self.sessions.lock().unwrap().iter() {
            if h == handle {
                sink.send(text.clone());
            }
        }
    }

    /// Simulate every shell on `handle` exiting.
    pub fn end_sessions(&self, handle: &SandboxHandle) {
        let mut sessions = self.sessions.lock().unwrap();
        for (h, sink) in sessions.iter() {
            if h == handle {
                sink.finish();
            }
        }
        sessions.retain(|(h, _)| h != handle);
    }
}

fn shell_reply(line: &str) -> String {
    match line.trim().strip_prefix("echo ") {
        Some(rest) => rest.trim().to_string(),
        None => String::new(),
    }
}

#[async_trait]
impl BackendAdapter for ScriptedAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn health_check(&self) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn provision(&self) -> Result<SandboxHandle, SandboxError> {
        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(SandboxError::provision("scripted provision failure"));
        }
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let handle = SandboxHandle::new(format!("scripted-{seq}"));
        self.live.lock().unwrap().insert(handle.clone());
        Ok(handle)
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let existed = self.live.lock().unwrap().remove(handle);
        self.end_sessions(handle);
        if !existed || self.fail_destroy.load(Ordering::SeqCst) {
            return Err(SandboxError::Destroy(format!("no such sandbox {handle}")));
        }
        Ok(())
    }

    async fn run_once(
        &self,
        handle: &SandboxHandle,
        command: &str,
    ) -> Result<ExecOutput, SandboxError> {
        if !self.is_live(handle) {
            return Err(SandboxError::Exec(format!("{handle} unreachable")));
        }
        let command = command.trim();
        if let Some(rest) = command.strip_prefix("exit ") {
            return Ok(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: rest.trim().parse().unwrap_or(1),
            });
        }
        if command.starts_with("echo ") {
            return Ok(ExecOutput {
                stdout: shell_reply(command),
                stderr: String::new(),
                exit_code: 0,
            });
        }
        Ok(ExecOutput {
            stdout: String::new(),
            stderr: format!("sh: 1: {command}: not found"),
            exit_code: 127,
        })
    }

    async fn open_session(&self, handle: &SandboxHandle) -> Result<OpenedSession, SandboxError> {
        if !self.is_live(handle) {
            return Err(SandboxError::SessionOpen(format!("{handle} unreachable")));
        }
        let (sink, source) = output::channel();
        self.sessions
            .lock()
            .unwrap()
            .push((handle.clone(), sink.clone()));
        Ok(OpenedSession {
            channel: Box::new(ScriptedChannel {
                label: handle.to_string(),
                sink: Mutex::new(Some(sink)),
                closed: AtomicBool::new(false),
            }),
            output: source,
        })
    }
}

struct ScriptedChannel {
    label: String,
    sink: Mutex<Option<OutputSink>>,
    closed: AtomicBool,
}

#[async_trait]
impl SessionChannel for ScriptedChannel {
    async fn write(&self, data: &[u8]) -> Result<(), SandboxError> {
        let guard = self.sink.lock().unwrap();
        let Some(sink) = guard.as_ref() else {
            return Err(SandboxError::SessionClosed(self.label.clone()));
        };
        if sink.is_finished() {
            return Err(SandboxError::SessionClosed(self.label.clone()));
        }

        let input = String::from_utf8_lossy(data);
        for line in input.lines() {
            if line.trim() == "exit" {
                sink.finish();
                break;
            }
            let raw = format!("\x1b[?2004h# {line}\r\n{}\r\n\x1b[6n", shell_reply(line));
            sink.send(sanitize(raw.as_bytes()));
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sink) = self.sink.lock().unwrap().take() {
            sink.finish();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
