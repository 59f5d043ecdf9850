//! Parallels backend implementation.

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::control::{CreateOptions, ParallelsControl, PrlctlControl};
use super::{ParallelsConfig, INIT_TIMEOUT, NETWORK_NAME_PREFIX};
use crate::config::parse_backend_config;
use crate::context::Context;
use crate::error::{HypervisorError, Result};
use crate::identity::{vm_id, MacAddress, VM_NAME_PREFIX};
use crate::lease::{AddressResolver, LeaseDirectory};
use crate::pool::NetworkPool;
use crate::rollback::Rollback;
use crate::traits::Hypervisor;
use crate::types::VirtualMachine;

/// Upper bound on deleting a half-created VM during rollback.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Parallels Desktop hypervisor backend.
pub struct ParallelsBackend {
    control: Arc<dyn ParallelsControl>,
    config: RwLock<ParallelsConfig>,
    pool: NetworkPool,
    leases: LeaseDirectory,
    resolver: AddressResolver,
    /// Parallels misbehaves when clones run concurrently.
    create_lock: tokio::sync::Mutex<()>,
}

impl ParallelsBackend {
    /// Backend using the real command-line tools and the default lease directory.
    pub fn new() -> Self {
        Self::with_control(Arc::new(PrlctlControl::new()), LeaseDirectory::default())
    }

    /// Backend using a custom control implementation and lease directory.
    pub fn with_control(control: Arc<dyn ParallelsControl>, leases: LeaseDirectory) -> Self {
        info!(lease_dir = %leases.dir().display(), "Creating Parallels hypervisor backend");
        Self {
            control,
            config: RwLock::new(ParallelsConfig::default()),
            pool: NetworkPool::new(),
            resolver: AddressResolver::new(Arc::new(leases.clone())),
            leases,
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Set how often lease files are checked.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.resolver = self.resolver.with_interval(interval);
        self
    }

    pub fn pool(&self) -> &NetworkPool {
        &self.pool
    }

    /// Replace the configuration with `bytes`, if non-empty.
    pub fn configure(&self, bytes: &[u8]) -> Result<()> {
        if let Some(cfg) = parse_backend_config::<ParallelsConfig>(bytes)? {
            *self
                .config
                .write()
                .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))? = cfg;
        }
        Ok(())
    }

    pub fn config(&self) -> Result<ParallelsConfig> {
        self.config
            .read()
            .map(|c| c.clone())
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    /// Fill the network pool from the host's isolation networks, once.
    async fn populate_networks(&self, ctx: &Context) -> Result<()> {
        if self.pool.is_populated()? {
            return Ok(());
        }

        let networks = self
            .control
            .network_list(ctx, NETWORK_NAME_PREFIX)
            .await
            .map_err(|e| e.wrap_with(|m| HypervisorError::QueryFailed(format!("populating networks: {}", m))))?;

        if networks.is_empty() {
            warn!(prefix = NETWORK_NAME_PREFIX, "No isolation networks found, every create will fail");
        }
        let count = networks.len();
        if self.pool.populate(networks)? {
            info!(capacity = count, "Network pool populated");
        }
        Ok(())
    }
}

impl Default for ParallelsBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hypervisor for ParallelsBackend {
    fn name(&self) -> &'static str {
        "parallels"
    }

    #[instrument(skip(self, ctx, config))]
    async fn init(&self, ctx: &Context, config: &[u8]) -> Result<()> {
        self.configure(config)?;
        let cfg = self.config()?;
        let ctx = ctx.clone().with_timeout(INIT_TIMEOUT);

        if cfg.license_key.is_empty() {
            warn!("No license key configured, skipping activation");
        } else {
            self.control.install_license(&ctx, &cfg.license_key).await?;
        }

        self.populate_networks(&ctx).await?;

        info!("Parallels backend initialized");
        Ok(())
    }

    #[instrument(skip(self, ctx))]
    async fn shutdown(&self, ctx: &Context) -> Result<()> {
        self.control.remove_license(ctx).await
    }

    #[instrument(skip(self, ctx))]
    async fn create(&self, ctx: &Context, name: &str) -> Result<VirtualMachine> {
        ctx.check()?;

        let network = self.pool.acquire()?.keep();
        let mut rollback = Rollback::new();
        let pool = self.pool.clone();
        let returned = network.clone();
        rollback.defer("return network", async move { pool.release(&returned) });

        let cfg = self.config()?;
        let mac = MacAddress::random();
        let opts = CreateOptions {
            id: vm_id(),
            image_path: cfg.image_directory.join(format!("{}.pvm", name)),
            working_dir: cfg.working_directory.clone(),
            mac: mac.to_compact(),
            network,
        };
        info!(vm_id = %opts.id, network = %opts.network, %mac, "Creating VM");

        let control = self.control.clone();
        let partial_id = opts.id.clone();
        rollback.defer("delete partial vm", async move {
            let ctx = Context::background().with_timeout(CLEANUP_TIMEOUT);
            control.vm_delete(&ctx, &partial_id).await
        });

        let result = async {
            {
                let _serialized = self.create_lock.lock().await;
                self.control
                    .vm_create(ctx, &opts)
                    .await
                    .map_err(|e| e.wrap_with(|m| HypervisorError::CreateFailed(format!("starting vm: {}", m))))?;
            }

            let addr = self
                .resolver
                .resolve(ctx, &opts.mac, cfg.address_timeout())
                .await?;
            Ok::<_, HypervisorError>(addr.unwrap_or_default())
        }
        .await;

        // On failure the partial VM is gone before the network goes back.
        let addr = rollback.finish(result).await?;

        info!(vm_id = %opts.id, %addr, "VM created");
        Ok(VirtualMachine::new(opts.id, name).with_addr(addr))
    }

    #[instrument(skip(self, ctx), fields(vm_id = %id))]
    async fn delete(&self, ctx: &Context, id: &str) -> Result<()> {
        let items = self
            .control
            .vm_list(ctx, id)
            .await
            .map_err(|e| e.wrap_with(|m| HypervisorError::QueryFailed(format!("fetching vm ({}) details: {}", id, m))))?;

        let vm = items
            .into_iter()
            .find(|item| item.name == id)
            .ok_or_else(|| HypervisorError::VmNotFound(id.to_string()))?;

        self.control.vm_delete(ctx, &vm.name).await?;

        // The VM is gone; nothing below may fail the call and leave it half-released.
        self.pool.release(&vm.hardware.net0.iface)?;
        if let Err(e) = self.leases.remove(&vm.hardware.net0.mac).await {
            warn!(error = %e, "Failed to remove lease");
        }

        info!(network = %vm.hardware.net0.iface, "VM deleted");
        Ok(())
    }

    #[instrument(skip(self, ctx))]
    async fn list(&self, ctx: &Context) -> Result<Vec<VirtualMachine>> {
        let items = self
            .control
            .vm_list(ctx, VM_NAME_PREFIX)
            .await
            .map_err(|e| e.wrap_with(|m| HypervisorError::QueryFailed(format!("fetching list: {}", m))))?;

        let mut vms = Vec::with_capacity(items.len());
        for item in items {
            let addr = self
                .resolver
                .resolve(ctx, &item.hardware.net0.mac, Duration::ZERO)
                .await
                .map_err(|e| e.wrap_with(|m| HypervisorError::QueryFailed(format!("getting {} addr: {}", item.name, m))))?;

            vms.push(VirtualMachine::new(item.name, item.description).with_addr(addr.unwrap_or_default()));
        }

        Ok(vms)
    }
}
