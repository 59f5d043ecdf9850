//! Command-line argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use nesting_node::HypervisorKind;

/// nesting - ephemeral VMs for nested CI jobs
#[derive(Parser, Debug)]
#[command(name = "nesting")]
#[command(about = "nesting - ephemeral VMs for nested CI jobs")]
#[command(version)]
pub struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Path to the control socket
    #[arg(long, env = "NESTING_SOCKET", global = true)]
    pub socket: Option<PathBuf>,

    /// Abandon client calls after this many seconds
    #[arg(long, global = true)]
    pub timeout_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon
    Serve {
        /// Hypervisor backend
        #[arg(long, value_enum)]
        hypervisor: Option<HypervisorKind>,

        /// Backend configuration file (YAML or JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Initialize the daemon's hypervisor
    Init {
        /// Backend configuration file (YAML or JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Create a VM, replacing whatever occupies the slot
    Create {
        /// Image name
        name: String,

        /// Slot number
        #[arg(allow_negative_numbers = true)]
        slot: Option<i32>,
    },

    /// Delete a VM
    Delete {
        /// VM id
        id: String,
    },

    /// List VMs
    List,

    /// Shut down the daemon's hypervisor
    Shutdown,

    /// Print the version
    Version,
}
