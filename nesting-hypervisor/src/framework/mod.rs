//! Driver for virtualization frameworks that expose explicit machine state.
//!
//! [`FrameworkBackend`] owns everything the contract requires (pool,
//! identity, rollback, state tracking) and delegates the actual boot to a
//! [`MachineEngine`]. An engine only has to turn a prepared working
//! directory into a running [`Machine`].

mod backend;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identity::MacAddress;
use crate::machine::Machine;

pub use backend::FrameworkBackend;

/// Settings of a [`FrameworkBackend`], decoded from the `init` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworkConfig {
    /// Where images live, one directory per image name.
    pub image_directory: PathBuf,

    /// Where per-VM state lives, one directory per VM id.
    pub working_directory: PathBuf,

    /// Number of VMs that may exist at once.
    pub max_machines: usize,

    /// How long a guest gets to shut down before it is powered off.
    pub graceful_stop_timeout_secs: u64,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        let base = dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".nesting");
        Self {
            image_directory: base.join("images"),
            working_directory: base.join("data"),
            max_machines: 2,
            graceful_stop_timeout_secs: 30,
        }
    }
}

/// Everything an engine needs to boot one VM.
#[derive(Debug, Clone)]
pub struct BootSpec {
    pub id: String,
    /// Image name as requested by the caller
    pub image: String,
    /// `image_directory/<image>`
    pub image_dir: PathBuf,
    /// `working_directory/<id>`, already created
    pub work_dir: PathBuf,
    pub mac: MacAddress,
    /// Pool entry reserved for this VM
    pub network: String,
}

/// Boots machines for a [`FrameworkBackend`].
#[async_trait]
pub trait MachineEngine: Send + Sync + 'static {
    type Machine: Machine + 'static;

    /// Short engine name used in logs.
    fn name(&self) -> &'static str;

    /// Copy the image into `spec.work_dir` and start the machine.
    ///
    /// Returns as soon as the machine has been started; the backend waits
    /// for it to reach `running` on its own.
    async fn boot(&self, spec: &BootSpec) -> Result<Self::Machine>;
}
