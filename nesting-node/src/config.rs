//! Daemon configuration and backend selection.

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use nesting_hypervisor::{Hypervisor, MockBackend, ParallelsBackend, TartBackend};

use crate::socket::socket_path;

/// How long the daemon waits for the backend to shut down on exit.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(300);

/// Hypervisor backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorKind {
    /// Parallels Desktop via prlctl
    Parallels,
    /// Tart via the tart CLI
    Tart,
    /// Simulated machines for development and testing
    Mock,
}

impl HypervisorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HypervisorKind::Parallels => "parallels",
            HypervisorKind::Tart => "tart",
            HypervisorKind::Mock => "mock",
        }
    }
}

impl Default for HypervisorKind {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            Self::Parallels
        } else {
            Self::Mock
        }
    }
}

impl std::fmt::Display for HypervisorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings of the `serve` command.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub hypervisor: HypervisorKind,
    pub socket_path: PathBuf,
    /// Backend configuration applied at startup. A later `init` payload
    /// replaces it.
    pub backend_config: Vec<u8>,
    pub shutdown_timeout: Duration,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            hypervisor: HypervisorKind::default(),
            socket_path: socket_path(),
            backend_config: Vec::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Read a backend configuration file. `None` means no configuration.
pub fn read_backend_config(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("Failed to read config file: {}", path.display())),
        None => Ok(Vec::new()),
    }
}

/// Build the backend selected by `kind` and apply `config` to it.
pub fn build_hypervisor(kind: HypervisorKind, config: &[u8]) -> Result<Arc<dyn Hypervisor>> {
    let hypervisor: Arc<dyn Hypervisor> = match kind {
        HypervisorKind::Parallels => {
            let backend = ParallelsBackend::new();
            backend.configure(config).context("Invalid parallels configuration")?;
            Arc::new(backend)
        }
        HypervisorKind::Tart => {
            let backend = TartBackend::new();
            backend.configure(config).context("Invalid tart configuration")?;
            Arc::new(backend)
        }
        HypervisorKind::Mock => {
            let backend = MockBackend::simulated();
            backend.configure(config).context("Invalid mock configuration")?;
            Arc::new(backend)
        }
    };

    info!(hypervisor = %kind, "Hypervisor backend ready");
    Ok(hypervisor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_mock_with_config() {
        let hypervisor = build_hypervisor(HypervisorKind::Mock, b"max_machines: 4\n").unwrap();
        assert_eq!(hypervisor.name(), "mock");
    }

    #[test]
    fn test_build_rejects_bad_config() {
        assert!(build_hypervisor(HypervisorKind::Mock, b"max_machines: [").is_err());
        assert!(build_hypervisor(HypervisorKind::Tart, b"address_timeout_secs: soon").is_err());
    }

    #[test]
    fn test_read_backend_config() {
        assert!(read_backend_config(None).unwrap().is_empty());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.yaml");
        std::fs::write(&path, "license_key: ABC\n").unwrap();
        assert_eq!(read_backend_config(Some(&path)).unwrap(), b"license_key: ABC\n");
        assert!(read_backend_config(Some(&dir.path().join("missing.yaml"))).is_err());
    }
}
