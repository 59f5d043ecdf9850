//! # nesting Common
//!
//! Shared utilities for the nesting daemon and its command-line client.
//!
//! ## Logging
//!
//! ```rust
//! use nesting_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(vm_id = "nesting-abc123", "VM created");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json};
