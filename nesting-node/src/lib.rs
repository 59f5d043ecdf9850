//! # nesting Node
//!
//! The nesting daemon fronts one hypervisor backend and hands out
//! short-lived VMs to local clients over a Unix socket.
//!
//! ## Architecture
//!
//! ```text
//!   nesting CLI ──► Client ──(unix socket)──► Server
//!                                               │
//!                                               ▼
//!                                        NestingService ──► SlotTable
//!                                               │
//!                                               ▼
//!                                      Arc<dyn Hypervisor>
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use nesting_hypervisor::{Context, MockBackend};
//! use nesting_node::NestingService;
//!
//! let service = NestingService::new(Arc::new(MockBackend::simulated()));
//! let ctx = Context::background();
//! service.init(&ctx, b"").await?;
//! let created = service.create(&ctx, "ubuntu-22.04", Some(0)).await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod server;
pub mod service;
pub mod slots;
pub mod socket;

pub use client::Client;
pub use config::{HypervisorKind, ServeConfig};
pub use error::{ClientError, ServiceError};
pub use server::Server;
pub use service::{CreateOutcome, NestingService};
pub use slots::SlotTable;
