//! Fixed pool of exclusive network resources.
//!
//! A backend populates the pool once during init with the isolated networks
//! the host already provides. Each VM checks one out for its lifetime, so
//! the pool size is a hard ceiling on concurrent VMs. Acquisition never
//! waits: an empty pool fails straight away with
//! [`HypervisorError::ResourceExhausted`].

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::error::{HypervisorError, Result};

/// One pool entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkResource {
    pub identifier: String,
    pub checked_out: bool,
}

#[derive(Debug, Default)]
struct PoolState {
    populated: bool,
    entries: Vec<NetworkResource>,
}

/// Shared handle to a network pool. Clones refer to the same pool.
#[derive(Debug, Clone, Default)]
pub struct NetworkPool {
    state: Arc<Mutex<PoolState>>,
}

impl NetworkPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an already populated pool.
    pub fn with_entries<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pool = Self::new();
        // A fresh pool cannot be poisoned or populated yet.
        let _ = pool.populate(identifiers);
        pool
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolState>> {
        self.state
            .lock()
            .map_err(|_| HypervisorError::Internal("Network pool lock poisoned".to_string()))
    }

    pub fn is_populated(&self) -> Result<bool> {
        Ok(self.lock()?.populated)
    }

    /// Fill the pool. Only the first call has an effect; returns whether it
    /// was this one.
    pub fn populate<I, S>(&self, identifiers: I) -> Result<bool>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.lock()?;
        if state.populated {
            return Ok(false);
        }

        state.entries = identifiers
            .into_iter()
            .map(|id| NetworkResource {
                identifier: id.into(),
                checked_out: false,
            })
            .collect();
        state.populated = true;

        debug!(capacity = state.entries.len(), "Network pool populated");
        Ok(true)
    }

    /// Check out a free entry.
    ///
    /// The returned guard puts the entry back when dropped, unless
    /// [`NetworkCheckout::keep`] was called.
    pub fn acquire(&self) -> Result<NetworkCheckout> {
        let mut state = self.lock()?;
        let entry = state
            .entries
            .iter_mut()
            .find(|e| !e.checked_out)
            .ok_or_else(|| HypervisorError::ResourceExhausted("no network available".to_string()))?;

        entry.checked_out = true;
        debug!(network = %entry.identifier, "Network checked out");

        Ok(NetworkCheckout {
            pool: self.clone(),
            identifier: entry.identifier.clone(),
            kept: false,
        })
    }

    /// Return an entry to the pool. Releasing a free entry is a no-op.
    pub fn release(&self, identifier: &str) -> Result<()> {
        let mut state = self.lock()?;
        match state.entries.iter_mut().find(|e| e.identifier == identifier) {
            Some(entry) => {
                entry.checked_out = false;
                debug!(network = %identifier, "Network returned");
            }
            None => warn!(network = %identifier, "Released network is not part of the pool"),
        }
        Ok(())
    }

    /// Guard an entry that is already checked out, typically one taken
    /// with [`NetworkCheckout::keep`] earlier.
    pub fn reclaim(&self, identifier: impl Into<String>) -> NetworkCheckout {
        NetworkCheckout {
            pool: self.clone(),
            identifier: identifier.into(),
            kept: false,
        }
    }

    /// Number of free entries.
    pub fn available(&self) -> Result<usize> {
        Ok(self.lock()?.entries.iter().filter(|e| !e.checked_out).count())
    }

    /// Total number of entries.
    pub fn capacity(&self) -> Result<usize> {
        Ok(self.lock()?.entries.len())
    }

    /// Snapshot of every entry.
    pub fn entries(&self) -> Result<Vec<NetworkResource>> {
        Ok(self.lock()?.entries.clone())
    }
}

/// A checked-out pool entry. Dropping it returns the entry.
#[derive(Debug)]
#[must_use = "dropping the checkout returns the network immediately"]
pub struct NetworkCheckout {
    pool: NetworkPool,
    identifier: String,
    kept: bool,
}

impl NetworkCheckout {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Keep the entry checked out past this guard. The owner becomes
    /// responsible for calling [`NetworkPool::release`].
    pub fn keep(mut self) -> String {
        self.kept = true;
        std::mem::take(&mut self.identifier)
    }
}

impl Drop for NetworkCheckout {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        if let Err(e) = self.pool.release(&self.identifier) {
            warn!(network = %self.identifier, error = %e, "Failed to return network");
        }
    }
}
