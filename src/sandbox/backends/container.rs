//! Shared-kernel container backend over the Docker Engine API.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use futures::{StreamExt, TryStreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::sandbox::adapter::{BackendAdapter, OpenedSession, SessionChannel};
use crate::sandbox::error::SandboxError;
use crate::sandbox::output::{self, OutputSink};
use crate::sandbox::sanitize::StreamSanitizer;
use crate::sandbox::types::{BackendKind, ContainerConfig, ExecOutput, SandboxHandle};

const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Docker-backed adapter.
///
/// Each `provision()` makes sure the base image is present (pulling it if
/// needed), creates a container running the shell with stdin open and a
/// TTY, and starts it. Sessions are `exec`s of the same shell attached to
/// a hijacked stdin/stdout connection.
pub struct ContainerAdapter {
    docker: Docker,
    config: ContainerConfig,
}

impl ContainerAdapter {
    pub fn new(config: ContainerConfig) -> Result<Self, SandboxError> {
        let docker = match &config.docker_socket {
            Some(path) => Docker::connect_with_socket(
                &path.to_string_lossy(),
                DOCKER_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            ),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| SandboxError::provision(format!("failed to connect to docker: {e}")))?;

        Ok(Self { docker, config })
    }

    async fn ensure_image(&self) -> Result<(), SandboxError> {
        match self.docker.inspect_image(&self.config.image).await {
            Ok(_) => {
                tracing::debug!(image = %self.config.image, "using existing image");
                return Ok(());
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => {
                return Err(SandboxError::provision(format!(
                    "inspect image {}: {e}",
                    self.config.image
                )));
            }
        }

        tracing::info!(image = %self.config.image, "pulling image");
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: self.config.image.clone(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| SandboxError::provision(format!("pull {}: {e}", self.config.image)))?;
        tracing::info!(image = %self.config.image, "image pulled");
        Ok(())
    }

    /// Start failed after create: remove the container so nothing leaks. If
    /// removal also fails, hand the id back to the caller.
    async fn discard_unstarted(&self, id: &str, reason: String) -> SandboxError {
        let removed = self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

        match removed {
            Ok(()) => SandboxError::provision(reason),
            Err(e) => {
                tracing::warn!(container = %id, error = %e, "failed to remove unstarted container");
                SandboxError::Provision {
                    reason,
                    handle: Some(SandboxHandle::new(id)),
                }
            }
        }
    }
}

#[async_trait]
impl BackendAdapter for ContainerAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn health_check(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::Exec(format!("docker unreachable: {e}")))
    }

    async fn provision(&self) -> Result<SandboxHandle, SandboxError> {
        self.ensure_image().await?;

        let container_config = Config {
            image: Some(self.config.image.clone()),
            cmd: Some(vec![self.config.shell.clone()]),
            open_stdin: Some(true),
            tty: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, container_config)
            .await
            .map_err(|e| SandboxError::provision(format!("create container: {e}")))?;

        for warning in &created.warnings {
            tracing::warn!(container = %created.id, warning = %warning, "docker create warning");
        }

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            return Err(self
                .discard_unstarted(&created.id, format!("start container: {e}"))
                .await);
        }

        tracing::info!(container = %created.id, image = %self.config.image, "container provisioned");
        Ok(SandboxHandle::new(created.id))
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        tracing::info!(container = %handle, "destroying container");

        match self
            .docker
            .stop_container(
                handle.as_str(),
                Some(StopContainerOptions {
                    t: self.config.stop_timeout_secs,
                }),
            )
            .await
        {
            Ok(()) => {}
            // Already stopped.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => return Err(SandboxError::Destroy(format!("stop {handle}: {e}"))),
        }

        self.docker
            .remove_container(handle.as_str(), None::<RemoveContainerOptions>)
            .await
            .map_err(|e| SandboxError::Destroy(format!("remove {handle}: {e}")))?;

        tracing::info!(container = %handle, "container destroyed");
        Ok(())
    }

    async fn run_once(
        &self,
        handle: &SandboxHandle,
        command: &str,
    ) -> Result<ExecOutput, SandboxError> {
        tracing::debug!(container = %handle, command = %command, "running one-shot command");

        let exec = self
            .docker
            .create_exec(
                handle.as_str(),
                CreateExecOptions {
                    cmd: Some(vec!["/bin/sh", "-c", command]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::Exec(format!("create exec in {handle}: {e}")))?;

        let started = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|e| SandboxError::Exec(format!("start exec in {handle}: {e}")))?;

        let StartExecResults::Attached { mut output, .. } = started else {
            return Err(SandboxError::Exec(format!(
                "exec in {handle} started detached"
            )));
        };

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(item) = output.next().await {
            match item.map_err(|e| SandboxError::Exec(format!("exec stream in {handle}: {e}")))? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    stdout.extend_from_slice(&message)
                }
                LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                LogOutput::StdIn { .. } => {}
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::Exec(format!("inspect exec in {handle}: {e}")))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            exit_code: inspect.exit_code.unwrap_or(0),
        })
    }

    async fn open_session(&self, handle: &SandboxHandle) -> Result<OpenedSession, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                handle.as_str(),
                CreateExecOptions {
                    cmd: Some(vec![self.config.shell.as_str()]),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::SessionOpen(format!("create exec in {handle}: {e}")))?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SandboxError::SessionOpen(format!("attach exec in {handle}: {e}")))?;

        let StartExecResults::Attached { output, input } = started else {
            return Err(SandboxError::SessionOpen(format!(
                "exec in {handle} started detached"
            )));
        };

        let (sink, source) = output::channel();
        let reader = tokio::spawn(relay_output(output, sink, exec.id.clone()));

        tracing::info!(container = %handle, exec_id = %exec.id, "interactive exec attached");

        Ok(OpenedSession {
            channel: Box::new(ContainerChannel {
                exec_id: exec.id,
                input: Mutex::new(Some(input)),
                reader: reader.abort_handle(),
                closed: AtomicBool::new(false),
            }),
            output: source,
        })
    }
}

async fn relay_output<S>(mut output: S, sink: OutputSink, exec_id: String)
where
    S: futures::Stream<Item = Result<LogOutput, BollardError>> + Unpin,
{
    let mut cleaner = StreamSanitizer::new();
    while let Some(item) = output.next().await {
        match item {
            Ok(log) => {
                let text = cleaner.feed(log_message(&log));
                tracing::trace!(exec_id = %exec_id, bytes = text.len(), "exec output");
                sink.send(text);
            }
            Err(e) => {
                tracing::warn!(exec_id = %exec_id, error = %e, "exec output stream failed");
                break;
            }
        }
    }
    tracing::debug!(exec_id = %exec_id, "exec output stream ended");
    sink.send(cleaner.flush());
    sink.finish();
}

fn log_message(log: &LogOutput) -> &[u8] {
    match log {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => message.as_ref(),
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

struct ContainerChannel {
    exec_id: String,
    input: Mutex<Option<Pin<Box<dyn AsyncWrite + Send>>>>,
    reader: AbortHandle,
    closed: AtomicBool,
}

#[async_trait]
impl SessionChannel for ContainerChannel {
    async fn write(&self, data: &[u8]) -> Result<(), SandboxError> {
        let mut guard = self.input.lock().await;
        let Some(input) = guard.as_mut() else {
            return Err(SandboxError::SessionClosed(self.exec_id.clone()));
        };

        let write_err = |e: std::io::Error| SandboxError::Write {
            session_id: self.exec_id.clone(),
            reason: e.to_string(),
        };
        input.write_all(data).await.map_err(write_err)?;
        input.flush().await.map_err(write_err)?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut input) = self.input.lock().await.take() {
            // EOF on stdin lets the shell exit on its own.
            let _ = input.shutdown().await;
        }
        // Dropping the reader drops its sink, which emits End.
        self.reader.abort();
        tracing::debug!(exec_id = %self.exec_id, "container session closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for ContainerChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
