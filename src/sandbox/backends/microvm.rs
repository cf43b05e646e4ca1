//! Firecracker micro-VM backend driven through the `ignite` CLI.
//!
//! Lifecycle and one-shot commands shell out to `ignite`; interactive
//! sessions run `ignite exec -t` inside a local pseudo-terminal and relay
//! its output.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};

use crate::sandbox::adapter::{BackendAdapter, OpenedSession, SessionChannel};
use crate::sandbox::error::SandboxError;
use crate::sandbox::host_command::{self, HostCommandResult, shell_escape};
use crate::sandbox::output::{self, OutputSink};
use crate::sandbox::sanitize::StreamSanitizer;
use crate::sandbox::types::{BackendKind, ExecOutput, MicroVmConfig, SandboxHandle};

const PTY_ROWS: u16 = 40;
const PTY_COLS: u16 = 120;

pub struct MicroVmAdapter {
    config: MicroVmConfig,
}

impl MicroVmAdapter {
    pub fn new(config: MicroVmConfig) -> Self {
        Self { config }
    }

    async fn ignite(&self, args: &[&str]) -> Result<HostCommandResult, SandboxError> {
        host_command::run(&self.config.ignite_bin, args).await
    }

    /// `ignite exec -t` inside a pty reports a missing or stopped VM only as
    /// terminal output, so check with a plain exec first.
    async fn ensure_reachable(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let result = self
            .ignite(&["exec", handle.as_str(), "--", "true"])
            .await
            .map_err(|e| SandboxError::SessionOpen(format!("spawn ignite exec: {e}")))?;
        if result.success() {
            return Ok(());
        }

        let stderr = result.stderr_string();
        let reason = match ignite_failure(&stderr) {
            Some(fatal) => fatal.to_string(),
            None => result.failure_summary(),
        };
        Err(SandboxError::SessionOpen(format!("{handle} unreachable: {reason}")))
    }

    fn run_args<'a>(&'a self, vm_name: &'a str, cpus: &'a str) -> Vec<&'a str> {
        vec![
            "run",
            self.config.image.as_str(),
            "--name",
            vm_name,
            "--cpus",
            cpus,
            "--memory",
            self.config.memory.as_str(),
            "--size",
            self.config.disk_size.as_str(),
            "--ssh",
        ]
    }
}

/// `vm-` plus eight hex characters from a fresh v4 UUID.
pub fn new_vm_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("vm-{}", &id[..8])
}

/// ignite logs its own failures through logrus as `FATA[....] message`.
/// Anything else on stderr belongs to the command that ran in the guest.
fn ignite_failure(stderr: &str) -> Option<&str> {
    stderr
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("FATA[") && !line.contains("exited with status"))
}

#[async_trait]
impl BackendAdapter for MicroVmAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::MicroVm
    }

    async fn health_check(&self) -> Result<(), SandboxError> {
        let result = self
            .ignite(&["version"])
            .await
            .map_err(|e| SandboxError::Exec(format!("ignite unavailable: {e}")))?;
        if result.success() {
            Ok(())
        } else {
            Err(SandboxError::Exec(format!(
                "ignite version: {}",
                result.failure_summary()
            )))
        }
    }

    async fn provision(&self) -> Result<SandboxHandle, SandboxError> {
        let vm_name = new_vm_name();
        let cpus = self.config.cpus.to_string();

        tracing::info!(vm = %vm_name, image = %self.config.image, "creating micro-VM");

        let result = self
            .ignite(&self.run_args(&vm_name, &cpus))
            .await
            .map_err(|e| SandboxError::provision(format!("spawn ignite run: {e}")))?;

        if result.success() {
            tracing::info!(vm = %vm_name, "micro-VM provisioned");
            return Ok(SandboxHandle::new(vm_name));
        }

        let reason = format!("ignite run {vm_name}: {}", result.failure_summary());

        // `ignite run` creates before it boots; clean up a VM that was created
        // but failed to start.
        let cleanup = self.ignite(&["rm", "-f", &vm_name]).await;
        match cleanup {
            Ok(r) if r.success() => Err(SandboxError::provision(reason)),
            Ok(r) => {
                tracing::warn!(vm = %vm_name, error = %r.failure_summary(), "cleanup after failed run did not succeed");
                Err(SandboxError::Provision {
                    reason,
                    handle: Some(SandboxHandle::new(vm_name)),
                })
            }
            Err(e) => {
                tracing::warn!(vm = %vm_name, error = %e, "cleanup after failed run did not start");
                Err(SandboxError::Provision {
                    reason,
                    handle: Some(SandboxHandle::new(vm_name)),
                })
            }
        }
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        tracing::info!(vm = %handle, "destroying micro-VM");

        let stop = self
            .ignite(&["stop", handle.as_str()])
            .await
            .map_err(|e| SandboxError::Destroy(format!("spawn ignite stop: {e}")))?;
        if !stop.success() {
            // `rm -f` below still removes a running VM.
            tracing::warn!(vm = %handle, error = %stop.failure_summary(), "ignite stop failed");
        }

        let rm = self
            .ignite(&["rm", "-f", handle.as_str()])
            .await
            .map_err(|e| SandboxError::Destroy(format!("spawn ignite rm: {e}")))?;
        if !rm.success() {
            return Err(SandboxError::Destroy(format!(
                "ignite rm {handle}: {}",
                rm.failure_summary()
            )));
        }

        tracing::info!(vm = %handle, "micro-VM destroyed");
        Ok(())
    }

    async fn run_once(
        &self,
        handle: &SandboxHandle,
        command: &str,
    ) -> Result<ExecOutput, SandboxError> {
        tracing::debug!(vm = %handle, command = %command, "running one-shot command");

        // ignite exec joins its arguments into one remote command line.
        let escaped = shell_escape(command);
        let result = self
            .ignite(&["exec", handle.as_str(), "--", "/bin/sh", "-c", &escaped])
            .await
            .map_err(|e| SandboxError::Exec(format!("spawn ignite exec: {e}")))?;

        let stderr = result.stderr_string();
        let Some(exit_code) = result.exit_code else {
            return Err(SandboxError::Exec(format!(
                "ignite exec {handle}: {}",
                result.failure_summary()
            )));
        };
        if exit_code != 0 {
            if let Some(fatal) = ignite_failure(&stderr) {
                return Err(SandboxError::Exec(format!("ignite exec {handle}: {fatal}")));
            }
        }

        Ok(ExecOutput {
            stdout: result.stdout_string(),
            stderr,
            exit_code: i64::from(exit_code),
        })
    }

    async fn open_session(&self, handle: &SandboxHandle) -> Result<OpenedSession, SandboxError> {
        self.ensure_reachable(handle).await?;

        let open_err = |stage: &str, e: anyhow::Error| {
            SandboxError::SessionOpen(format!("{stage} for {handle}: {e}"))
        };

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: PTY_ROWS,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| open_err("openpty", e))?;

        let mut cmd = CommandBuilder::new(&self.config.ignite_bin);
        cmd.args([
            "exec",
            "-t",
            handle.as_str(),
            "--",
            self.config.session_shell.as_str(),
        ]);

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| open_err("spawn ignite exec", e))?;
        // The reader only sees EOF once every slave fd is closed.
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| open_err("take pty writer", e))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| open_err("clone pty reader", e))?;
        let killer = child.clone_killer();

        let (sink, source) = output::channel();
        let label = handle.to_string();

        let reader_sink = sink.clone();
        let reader_label = label.clone();
        tokio::task::spawn_blocking(move || relay_pty(reader, reader_sink, &reader_label));

        // Process exit and stream close both finish the sink; End fires once.
        let exit_label = label.clone();
        tokio::task::spawn_blocking(move || {
            match child.wait() {
                Ok(status) => {
                    tracing::debug!(vm = %exit_label, code = status.exit_code(), "ignite exec exited")
                }
                Err(e) => tracing::warn!(vm = %exit_label, error = %e, "waiting on ignite exec failed"),
            }
            sink.finish();
        });

        tracing::info!(vm = %handle, "interactive shell attached");

        Ok(OpenedSession {
            channel: Box::new(MicroVmChannel {
                label,
                writer: Arc::new(Mutex::new(Some(writer))),
                master: Mutex::new(Some(pair.master)),
                killer: Mutex::new(Some(killer)),
                closed: AtomicBool::new(false),
            }),
            output: source,
        })
    }
}

fn relay_pty(mut reader: Box<dyn Read + Send>, sink: OutputSink, label: &str) {
    let mut buf = [0u8; 4096];
    let mut cleaner = StreamSanitizer::new();
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => sink.send(cleaner.feed(&buf[..n])),
            // EIO once the child side of the pty is gone.
            Err(e) => {
                tracing::debug!(vm = %label, error = %e, "pty read ended");
                break;
            }
        }
    }
    sink.send(cleaner.flush());
    sink.finish();
}

struct MicroVmChannel {
    label: String,
    writer: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    killer: Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
    closed: AtomicBool,
}

impl MicroVmChannel {
    fn shutdown(&self) {
        if let Some(mut killer) = self.killer.lock().ok().and_then(|mut k| k.take()) {
            if let Err(e) = killer.kill() {
                tracing::debug!(vm = %self.label, error = %e, "kill ignite exec");
            }
        }
        if let Ok(mut writer) = self.writer.lock() {
            writer.take();
        }
        if let Ok(mut master) = self.master.lock() {
            master.take();
        }
    }
}

#[async_trait]
impl SessionChannel for MicroVmChannel {
    async fn write(&self, data: &[u8]) -> Result<(), SandboxError> {
        let writer = self.writer.clone();
        let label = self.label.clone();
        let data = data.to_vec();

        // The pty write blocks while the guest is not reading.
        tokio::task::spawn_blocking(move || {
            let write_err = |reason: String| SandboxError::Write {
                session_id: label.clone(),
                reason,
            };
            let mut guard = writer
                .lock()
                .map_err(|_| write_err("writer lock poisoned".into()))?;
            let Some(writer) = guard.as_mut() else {
                return Err(SandboxError::SessionClosed(label.clone()));
            };
            writer
                .write_all(&data)
                .and_then(|()| writer.flush())
                .map_err(|e| write_err(e.to_string()))
        })
        .await
        .map_err(|e| SandboxError::Write {
            session_id: self.label.clone(),
            reason: e.to_string(),
        })?
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown();
        tracing::debug!(vm = %self.label, "micro-VM session closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for MicroVmChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}
