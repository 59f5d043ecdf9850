//! Parallels Desktop backend.
//!
//! Driven entirely through `prlctl`/`prlsrvctl`. Each VM is a linked clone
//! attached to its own host-only network taken from a pool of networks
//! named `isolation-*`. Addresses come from lease files written by the host
//! DHCP hook, one per MAC address.

mod backend;
pub mod control;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use backend::ParallelsBackend;
pub use control::{ParallelsControl, PrlctlControl};

/// Upper bound for license activation and pool population.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Prefix of the host-only networks the pool is built from.
pub const NETWORK_NAME_PREFIX: &str = "isolation-";

/// Settings of a [`ParallelsBackend`], decoded from the `init` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelsConfig {
    /// Directory holding `<image>.pvm` bundles.
    pub image_directory: PathBuf,

    /// Directory linked clones are created in.
    pub working_directory: PathBuf,

    /// License installed on init. Empty skips activation.
    pub license_key: String,

    /// How long create waits for a VM to obtain an address.
    pub address_timeout_secs: u64,
}

impl Default for ParallelsConfig {
    fn default() -> Self {
        Self {
            image_directory: PathBuf::new(),
            working_directory: PathBuf::new(),
            license_key: String::new(),
            address_timeout_secs: 300,
        }
    }
}

impl ParallelsConfig {
    pub fn address_timeout(&self) -> Duration {
        Duration::from_secs(self.address_timeout_secs)
    }
}
