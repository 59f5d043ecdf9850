//! Generic framework backend implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::{BootSpec, FrameworkConfig, MachineEngine};
use crate::config::parse_backend_config;
use crate::context::Context;
use crate::error::{HypervisorError, Result};
use crate::identity::{vm_id, MacAddress};
use crate::machine::{stop_machine, wait_until_running, Machine};
use crate::pool::{NetworkCheckout, NetworkPool};
use crate::rollback::Rollback;
use crate::traits::Hypervisor;
use crate::types::VirtualMachine;

/// Upper bound on tearing down a half-booted machine during rollback.
const ROLLBACK_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Hypervisor backend built on a [`MachineEngine`].
pub struct FrameworkBackend<E: MachineEngine> {
    engine: E,
    config: RwLock<FrameworkConfig>,
    pool: NetworkPool,
    machines: Mutex<HashMap<String, Record<E::Machine>>>,
}

/// A fully created VM. Dropping the record returns its network.
struct Record<M> {
    vm: VirtualMachine,
    machine: Arc<M>,
    work_dir: PathBuf,
    _network: NetworkCheckout,
}

impl<E: MachineEngine> FrameworkBackend<E> {
    /// Create a backend with the default configuration.
    pub fn new(engine: E) -> Self {
        Self::with_config(engine, FrameworkConfig::default())
    }

    /// Create a backend with an explicit configuration.
    ///
    /// A non-empty `init` payload still replaces it.
    pub fn with_config(engine: E, config: FrameworkConfig) -> Self {
        info!(engine = engine.name(), "Creating framework hypervisor backend");
        Self {
            engine,
            config: RwLock::new(config),
            pool: NetworkPool::new(),
            machines: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn pool(&self) -> &NetworkPool {
        &self.pool
    }

    pub fn config(&self) -> Result<FrameworkConfig> {
        self.config
            .read()
            .map(|c| c.clone())
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    /// Replace the configuration with `bytes`, if non-empty.
    pub fn configure(&self, bytes: &[u8]) -> Result<()> {
        if let Some(cfg) = parse_backend_config::<FrameworkConfig>(bytes)? {
            if cfg.max_machines == 0 {
                return Err(HypervisorError::InvalidConfig(
                    "max_machines must be at least 1".to_string(),
                ));
            }
            *self
                .config
                .write()
                .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))? = cfg;
        }
        Ok(())
    }

    fn machines(&self) -> Result<MutexGuard<'_, HashMap<String, Record<E::Machine>>>> {
        self.machines
            .lock()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    fn graceful_timeout(cfg: &FrameworkConfig) -> Duration {
        Duration::from_secs(cfg.graceful_stop_timeout_secs)
    }

    /// Prepare the working directory and boot the machine up to `running`.
    ///
    /// Every step registers its undo action on `rollback`.
    async fn boot(
        &self,
        ctx: &Context,
        spec: &BootSpec,
        graceful: Duration,
        rollback: &mut Rollback,
    ) -> Result<Arc<E::Machine>> {
        tokio::fs::create_dir_all(&spec.work_dir).await.map_err(|e| {
            HypervisorError::CreateFailed(format!(
                "creating vm directory {}: {}",
                spec.work_dir.display(),
                e
            ))
        })?;
        let dir = spec.work_dir.clone();
        rollback.defer("remove vm directory", async move { remove_dir(&dir).await });

        let machine = ctx
            .run(self.engine.boot(spec))
            .await
            .map_err(|e| e.wrap_with(|m| HypervisorError::CreateFailed(format!("booting vm: {}", m))))?;
        let machine = Arc::new(machine);

        let booted = machine.clone();
        rollback.defer("stop machine", async move {
            let ctx = Context::background().with_timeout(ROLLBACK_STOP_TIMEOUT);
            stop_machine(&ctx, booted.as_ref(), graceful).await
        });

        let mut states = machine.subscribe();
        wait_until_running(ctx, &mut states).await?;
        Ok(machine)
    }
}

async fn remove_dir(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(HypervisorError::Internal(format!(
            "removing {}: {}",
            path.display(),
            e
        ))),
    }
}

#[async_trait]
impl<E: MachineEngine> Hypervisor for FrameworkBackend<E> {
    fn name(&self) -> &'static str {
        self.engine.name()
    }

    #[instrument(skip(self, ctx, config), fields(engine = self.engine.name()))]
    async fn init(&self, ctx: &Context, config: &[u8]) -> Result<()> {
        ctx.check()?;
        self.configure(config)?;

        let cfg = self.config()?;
        tokio::fs::create_dir_all(&cfg.working_directory).await.map_err(|e| {
            HypervisorError::InvalidConfig(format!(
                "creating working directory {}: {}",
                cfg.working_directory.display(),
                e
            ))
        })?;

        let networks = (0..cfg.max_machines).map(|i| format!("vmnet-{}", i));
        if self.pool.populate(networks)? {
            info!(capacity = cfg.max_machines, "Machine pool ready");
        }

        info!(working_directory = %cfg.working_directory.display(), "Framework backend initialized");
        Ok(())
    }

    #[instrument(skip(self, ctx), fields(engine = self.engine.name()))]
    async fn shutdown(&self, ctx: &Context) -> Result<()> {
        let ids: Vec<String> = self.machines()?.keys().cloned().collect();
        if ids.is_empty() {
            return Ok(());
        }

        info!(count = ids.len(), "Tearing down remaining machines");
        let mut failed = 0;
        for id in ids {
            match self.delete(ctx, &id).await {
                Ok(()) => {}
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    warn!(vm_id = %id, error = %e, "Failed to tear down machine");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(HypervisorError::Internal(format!(
                "{} machine(s) could not be torn down",
                failed
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, ctx), fields(engine = self.engine.name()))]
    async fn create(&self, ctx: &Context, name: &str) -> Result<VirtualMachine> {
        ctx.check()?;

        let network = self.pool.acquire()?.keep();
        let mut rollback = Rollback::new();
        let pool = self.pool.clone();
        let returned = network.clone();
        rollback.defer("return network", async move { pool.release(&returned) });

        let cfg = self.config()?;
        let id = vm_id();
        let spec = BootSpec {
            id: id.clone(),
            image: name.to_string(),
            image_dir: cfg.image_directory.join(name),
            work_dir: cfg.working_directory.join(&id),
            mac: MacAddress::random(),
            network: network.clone(),
        };
        info!(vm_id = %id, network = %spec.network, mac = %spec.mac, "Creating VM");

        let result = self
            .boot(ctx, &spec, Self::graceful_timeout(&cfg), &mut rollback)
            .await;
        // Teardown runs before the network goes back, even when this
        // future is dropped midway.
        let machine = rollback.finish(result).await?;

        let vm = VirtualMachine::new(&id, name).with_addr(machine.address());
        self.machines()?.insert(
            id.clone(),
            Record {
                vm: vm.clone(),
                machine,
                work_dir: spec.work_dir,
                _network: self.pool.reclaim(network),
            },
        );

        info!(vm_id = %id, addr = %vm.addr, "VM created");
        Ok(vm)
    }

    #[instrument(skip(self, ctx), fields(vm_id = %id))]
    async fn delete(&self, ctx: &Context, id: &str) -> Result<()> {
        let (machine, work_dir) = {
            let machines = self.machines()?;
            let record = machines
                .get(id)
                .ok_or_else(|| HypervisorError::VmNotFound(id.to_string()))?;
            (record.machine.clone(), record.work_dir.clone())
        };
        let cfg = self.config()?;

        stop_machine(ctx, machine.as_ref(), Self::graceful_timeout(&cfg))
            .await
            .map_err(|e| e.wrap_with(|m| HypervisorError::DeleteFailed(format!("stopping vm {}: {}", id, m))))?;

        remove_dir(&work_dir)
            .await
            .map_err(|e| e.wrap_with(|m| HypervisorError::DeleteFailed(format!("deleting vm dir: {}", m))))?;

        // Only now is the VM gone; dropping the record returns its network.
        let removed = self.machines()?.remove(id);
        drop(removed);

        info!("VM deleted");
        Ok(())
    }

    async fn list(&self, _ctx: &Context) -> Result<Vec<VirtualMachine>> {
        let mut vms: Vec<VirtualMachine> = self.machines()?.values().map(|r| r.vm.clone()).collect();
        vms.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(vms)
    }
}
