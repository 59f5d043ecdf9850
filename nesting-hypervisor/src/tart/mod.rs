//! Tart backend.
//!
//! Each VM is a local clone of a Tart image running in a `tart run` child
//! process owned by the backend. Tart hands out addresses itself, so there
//! is no lease polling here; `tart ip --wait` does the waiting.

mod backend;
pub mod control;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use backend::TartBackend;
pub use control::{RunHandle, TartCli, TartControl};

/// How long `tart ip` may take while listing VMs.
pub const LIST_ADDRESS_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings of a [`TartBackend`], decoded from the `init` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TartConfig {
    /// How long create waits for a VM to obtain an address.
    pub address_timeout_secs: u64,
}

impl Default for TartConfig {
    fn default() -> Self {
        Self {
            address_timeout_secs: 300,
        }
    }
}

impl TartConfig {
    pub fn address_timeout(&self) -> Duration {
        Duration::from_secs(self.address_timeout_secs)
    }
}
