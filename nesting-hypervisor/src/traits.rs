//! Core hypervisor abstraction trait.

use async_trait::async_trait;

use crate::context::Context;
use crate::error::Result;
use crate::types::VirtualMachine;

/// Core hypervisor abstraction trait.
///
/// Every backend implements this trait; the service picks one at startup and
/// holds it as `Arc<dyn Hypervisor>`. The methods carry behavioral
/// guarantees that callers rely on regardless of the backend:
///
/// - `create` is safe to call concurrently. Shared allocation state (network
///   pools, id spaces) is guarded by the backend's own locks. If any step
///   fails after a resource was acquired, the backend releases it and
///   destroys the partial VM before returning the error.
/// - `delete` is safe to retry. A failed delete releases nothing a later
///   successful delete would release again, and the VM keeps appearing in
///   `list` until its teardown has finished.
/// - `list` only reports VMs that are fully created and not yet fully
///   deleted. If the details of any single VM cannot be resolved the whole
///   call fails.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// One-time setup, such as license activation or pool population.
    ///
    /// `config` is the opaque backend configuration supplied by the client;
    /// empty means "keep the defaults". Not required to be idempotent.
    async fn init(&self, ctx: &Context, config: &[u8]) -> Result<()>;

    /// One-time teardown. Not required to be idempotent.
    async fn shutdown(&self, ctx: &Context) -> Result<()>;

    // =========================================================================
    // Virtual Machines
    // =========================================================================

    /// Create and boot a VM from the image `name`.
    async fn create(&self, ctx: &Context, name: &str) -> Result<VirtualMachine>;

    /// Tear down the VM `id`.
    async fn delete(&self, ctx: &Context, id: &str) -> Result<()>;

    /// All VMs currently owned by this backend.
    async fn list(&self, ctx: &Context) -> Result<Vec<VirtualMachine>>;
}
