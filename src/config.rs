use std::path::PathBuf;

use crate::sandbox::{
    BackendKind, ContainerConfig, MicroVmConfig, SandboxRuntimeConfig,
};

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub sentry_dsn: Option<String>,
    pub environment: String,
    pub data_dir: PathBuf,
    pub runtime: SandboxRuntimeConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw_values(|key| std::env::var(key).ok())
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(get: impl Fn(&str) -> Option<String>) -> Self {
        let value = |key: &str| get(key).filter(|s| !s.trim().is_empty());

        let port = value("PORT").and_then(|v| v.parse().ok()).unwrap_or(3000);
        let sentry_dsn = value("SENTRY_DSN");
        let environment = value("ENVIRONMENT").unwrap_or_else(|| "development".to_string());

        let data_dir = value("DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".shellbox")
        });

        let backend = match value("SANDBOX_BACKEND") {
            Some(raw) => BackendKind::parse(&raw).unwrap_or_else(|| {
                tracing::warn!(value = %raw, "unknown SANDBOX_BACKEND, using environment default");
                default_backend(&environment)
            }),
            None => default_backend(&environment),
        };

        let runtime = match backend {
            BackendKind::Container => {
                let defaults = ContainerConfig::default();
                SandboxRuntimeConfig::Container(ContainerConfig {
                    image: value("CONTAINER_IMAGE").unwrap_or(defaults.image),
                    docker_socket: value("DOCKER_SOCKET").map(PathBuf::from),
                    ..defaults
                })
            }
            BackendKind::MicroVm => {
                let defaults = MicroVmConfig::default();
                SandboxRuntimeConfig::MicroVm(MicroVmConfig {
                    ignite_bin: value("IGNITE_BIN")
                        .map(PathBuf::from)
                        .unwrap_or(defaults.ignite_bin),
                    image: value("MICROVM_IMAGE").unwrap_or(defaults.image),
                    cpus: value("MICROVM_CPUS")
                        .and_then(|v| v.parse().ok())
                        .filter(|n| *n > 0)
                        .unwrap_or(defaults.cpus),
                    memory: value("MICROVM_MEMORY").unwrap_or(defaults.memory),
                    disk_size: value("MICROVM_DISK").unwrap_or(defaults.disk_size),
                    ..defaults
                })
            }
        };

        Config {
            port,
            sentry_dsn,
            environment,
            data_dir,
            runtime,
        }
    }
}

/// Local development runs containers; anything deployed runs micro-VMs.
fn default_backend(environment: &str) -> BackendKind {
    match environment {
        "development" | "local" => BackendKind::Container,
        _ => BackendKind::MicroVm,
    }
}
