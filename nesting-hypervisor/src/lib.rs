//! # nesting Hypervisor
//!
//! Hypervisor abstraction layer for ephemeral virtual machines.
//!
//! This crate provides one contract and several interchangeable backends:
//! - **Parallels** - `prlctl` driven, addresses from DHCP lease files
//! - **Tart** - `tart` driven, one supervised `tart run` process per VM
//! - **Mock** - the framework driver over an in-process simulated engine
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Hypervisor Trait             │
//! │  (init, shutdown, create, delete, list) │
//! └─────────────────────┬───────────────────┘
//!                       │
//!         ┌─────────────┼──────────────────┐
//!         ▼             ▼                  ▼
//! ┌───────────────┐ ┌──────────────┐ ┌──────────────────────┐
//! │ Parallels     │ │ TartBackend  │ │ FrameworkBackend<E>  │
//! │ Backend       │ │              │ │ (MockBackend)        │
//! └───────┬───────┘ └──────┬───────┘ └──────────┬───────────┘
//!         │                │                    │
//!         ▼                ▼                    ▼
//!   pool, lease,       rollback            pool, machine,
//!   rollback                               rollback
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use nesting_hypervisor::{Context, Hypervisor, MockBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MockBackend::simulated();
//!     let ctx = Context::background();
//!
//!     backend.init(&ctx, b"").await.unwrap();
//!     let vm = backend.create(&ctx, "ubuntu-22.04").await.unwrap();
//!     backend.delete(&ctx, &vm.id).await.unwrap();
//! }
//! ```

pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod framework;
pub mod identity;
pub mod lease;
pub mod machine;
pub mod mock;
pub mod parallels;
pub mod pool;
pub mod rollback;
pub mod tart;
pub mod traits;
pub mod types;

pub use context::{CancelHandle, Context};
pub use error::{HypervisorError, Result};
pub use framework::{FrameworkBackend, FrameworkConfig, MachineEngine};
pub use identity::{vm_id, MacAddress, VM_NAME_PREFIX};
pub use machine::{Machine, MachineState};
pub use mock::{MockBackend, SimulatedEngine};
pub use parallels::{ParallelsBackend, ParallelsConfig};
pub use pool::{NetworkCheckout, NetworkPool, NetworkResource};
pub use rollback::Rollback;
pub use tart::{TartBackend, TartConfig};
pub use traits::Hypervisor;
pub use types::VirtualMachine;
