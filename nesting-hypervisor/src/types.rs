//! Type definitions shared by every backend.

use serde::{Deserialize, Serialize};

// =============================================================================
// VIRTUAL MACHINE
// =============================================================================

/// A VM as reported to callers.
///
/// `id` is assigned by the backend and never changes. `addr` may be empty
/// when the address has not been resolved yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachine {
    /// Backend-assigned identifier
    pub id: String,
    /// Image the VM was created from
    pub name: String,
    /// Network address, possibly empty
    pub addr: String,
}

impl VirtualMachine {
    /// Create a VM description with no address yet.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            addr: String::new(),
        }
    }

    /// Set the network address.
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// True once an address is known.
    pub fn has_addr(&self) -> bool {
        !self.addr.is_empty()
    }
}

impl std::fmt::Display for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.id, self.name, self.addr)
    }
}
