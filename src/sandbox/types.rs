use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ── Sandbox identity ────────────────────────────────────────────────

/// Backend-specific name of one provisioned environment: a container id or
/// a micro-VM name. Opaque to everything but the adapter that created it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxHandle(String);

impl SandboxHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Backend kind ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Container,
    MicroVm,
}

impl BackendKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "container" | "docker" => Some(Self::Container),
            "microvm" | "firecracker" | "ignite" => Some(Self::MicroVm),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::MicroVm => "microvm",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Exec model ──────────────────────────────────────────────────────

/// Result of a one-shot command. A nonzero `exit_code` is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

// ── Backend configs ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub image: String,
    pub shell: String,
    /// Explicit Docker socket; `None` uses the local defaults.
    pub docker_socket: Option<PathBuf>,
    pub stop_timeout_secs: i64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "ubuntu:latest".into(),
            shell: "/bin/sh".into(),
            docker_socket: None,
            stop_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MicroVmConfig {
    pub ignite_bin: PathBuf,
    pub image: String,
    pub cpus: u8,
    pub memory: String,
    pub disk_size: String,
    /// Shell used for interactive sessions; one-shot commands use `/bin/sh -c`.
    pub session_shell: String,
}

impl Default for MicroVmConfig {
    fn default() -> Self {
        Self {
            ignite_bin: PathBuf::from("ignite"),
            image: "weaveworks/ignite-ubuntu:latest".into(),
            cpus: 1,
            memory: "512MB".into(),
            disk_size: "5GB".into(),
            session_shell: "/bin/bash".into(),
        }
    }
}

/// Which adapter to build, with its settings.
#[derive(Debug, Clone)]
pub enum SandboxRuntimeConfig {
    Container(ContainerConfig),
    MicroVm(MicroVmConfig),
}

impl SandboxRuntimeConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Container(_) => BackendKind::Container,
            Self::MicroVm(_) => BackendKind::MicroVm,
        }
    }
}
