//! Request handler: lifecycle state, slot bookkeeping and dispatch to the
//! hypervisor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, instrument, warn};

use nesting_hypervisor::{Context, Hypervisor, VirtualMachine};

use crate::error::{Result, ServiceError};
use crate::slots::SlotTable;

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOutcome {
    pub vm: VirtualMachine,
    /// The VM that occupied the slot before and was deleted to make room.
    pub stomped_id: Option<String>,
}

#[derive(Debug, Default)]
struct ServiceState {
    initialized: bool,
    slots: SlotTable,
}

/// The nesting request handler.
///
/// The service is either uninitialized or initialized. Every call except
/// `init` fails with [`ServiceError::NotInitialized`] until `init` succeeds.
///
/// Shared state sits behind a short-lived mutex that is never held across a
/// hypervisor call. Creates naming the same slot are serialized by a
/// per-slot lock so that deleting the previous occupant and creating its
/// replacement happen as one step; creates on different slots and unslotted
/// creates run in parallel.
pub struct NestingService {
    hypervisor: Arc<dyn Hypervisor>,
    state: Mutex<ServiceState>,
    /// Only slots with a holder or a waiter have an entry.
    slot_locks: SlotLocks,
    lifecycle: AsyncMutex<()>,
}

type SlotLocks = Mutex<HashMap<i32, Arc<AsyncMutex<()>>>>;

/// Exclusive use of one slot.
///
/// Dropping it releases the slot and forgets its lock unless another
/// create is already waiting on it.
struct SlotGuard<'a> {
    locks: &'a SlotLocks,
    slot: i32,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        forget_idle_lock(self.locks, self.slot);
    }
}

fn forget_idle_lock(locks: &SlotLocks, slot: i32) {
    // Waiters clone the lock under this mutex, so the count cannot grow
    // while it is held.
    let Ok(mut locks) = locks.lock() else {
        return;
    };
    if matches!(locks.get(&slot), Some(lock) if Arc::strong_count(lock) == 1) {
        locks.remove(&slot);
    }
}

impl NestingService {
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> Self {
        info!(hypervisor = hypervisor.name(), "Creating nesting service");
        Self {
            hypervisor,
            state: Mutex::new(ServiceState::default()),
            slot_locks: Mutex::new(HashMap::new()),
            lifecycle: AsyncMutex::new(()),
        }
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.state()?.initialized)
    }

    /// The VM currently bound to `slot`.
    pub fn slot_occupant(&self, slot: i32) -> Result<Option<String>> {
        Ok(self.state()?.slots.lookup(slot).map(str::to_string))
    }

    fn state(&self) -> Result<MutexGuard<'_, ServiceState>> {
        self.state
            .lock()
            .map_err(|_| ServiceError::Internal("Lock poisoned".to_string()))
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.state()?.initialized {
            Ok(())
        } else {
            Err(ServiceError::NotInitialized)
        }
    }

    /// Wait for exclusive use of `slot`.
    async fn lock_slot(&self, ctx: &Context, slot: i32) -> Result<SlotGuard<'_>> {
        let lock = self
            .slot_locks
            .lock()
            .map_err(|_| ServiceError::Internal("Lock poisoned".to_string()))?
            .entry(slot)
            .or_default()
            .clone();

        let locked = ctx.run(async { Ok(lock.lock_owned().await) }).await;
        match locked {
            Ok(guard) => Ok(SlotGuard {
                locks: &self.slot_locks,
                slot,
                guard: Some(guard),
            }),
            Err(e) => {
                forget_idle_lock(&self.slot_locks, slot);
                Err(e.into())
            }
        }
    }

    /// Number of slots with a create holding or waiting for their lock.
    pub fn busy_slots(&self) -> Result<usize> {
        Ok(self
            .slot_locks
            .lock()
            .map_err(|_| ServiceError::Internal("Lock poisoned".to_string()))?
            .len())
    }

    #[instrument(skip(self, ctx, config), fields(config_len = config.len()))]
    pub async fn init(&self, ctx: &Context, config: &[u8]) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state()?.initialized {
            return Err(ServiceError::AlreadyInitialized);
        }

        self.hypervisor.init(ctx, config).await?;

        self.state()?.initialized = true;
        info!("Service initialized");
        Ok(())
    }

    #[instrument(skip(self, ctx))]
    pub async fn shutdown(&self, ctx: &Context) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.ensure_initialized()?;

        self.hypervisor.shutdown(ctx).await?;

        self.state()?.initialized = false;
        info!("Service shut down");
        Ok(())
    }

    /// Create a VM from image `name`, optionally bound to `slot`.
    ///
    /// If `slot` is occupied, its VM is deleted first. When that delete
    /// fails the create fails too and the slot keeps its occupant, so the
    /// same call can simply be retried.
    #[instrument(skip(self, ctx))]
    pub async fn create(&self, ctx: &Context, name: &str, slot: Option<i32>) -> Result<CreateOutcome> {
        self.ensure_initialized()?;

        let Some(slot) = slot else {
            let vm = self.hypervisor.create(ctx, name).await?;
            info!(vm_id = %vm.id, "VM created");
            return Ok(CreateOutcome { vm, stomped_id: None });
        };

        let _slot_guard = self.lock_slot(ctx, slot).await?;

        let occupant = self.slot_occupant(slot)?;
        if let Some(old) = &occupant {
            info!(vm_id = %old, "Slot occupied, deleting previous VM");
            if let Err(source) = self.hypervisor.delete(ctx, old).await {
                warn!(vm_id = %old, error = %source, "Failed to delete previous VM");
                return Err(ServiceError::StompFailed {
                    slot,
                    id: old.clone(),
                    source,
                });
            }
            self.state()?.slots.unbind_by_occupant(old);
        }

        let vm = self.hypervisor.create(ctx, name).await?;
        self.state()?.slots.bind(slot, vm.id.clone());

        info!(vm_id = %vm.id, "VM created");
        Ok(CreateOutcome {
            vm,
            stomped_id: occupant,
        })
    }

    #[instrument(skip(self, ctx))]
    pub async fn delete(&self, ctx: &Context, id: &str) -> Result<()> {
        self.ensure_initialized()?;

        self.hypervisor.delete(ctx, id).await?;

        let cleared = self.state()?.slots.unbind_by_occupant(id);
        info!(?cleared, "VM deleted");
        Ok(())
    }

    #[instrument(skip(self, ctx))]
    pub async fn list(&self, ctx: &Context) -> Result<Vec<VirtualMachine>> {
        self.ensure_initialized()?;
        Ok(self.hypervisor.list(ctx).await?)
    }
}
