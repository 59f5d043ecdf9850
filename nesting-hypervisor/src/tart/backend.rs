//! Tart backend implementation.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::control::{parse_vm_list, RunHandle, TartCli, TartControl};
use super::{TartConfig, LIST_ADDRESS_TIMEOUT};
use crate::config::parse_backend_config;
use crate::context::Context;
use crate::error::{HypervisorError, Result};
use crate::identity::{vm_id, VM_NAME_PREFIX};
use crate::rollback::Rollback;
use crate::traits::Hypervisor;
use crate::types::VirtualMachine;

/// Upper bound on deleting a clone during rollback.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Tart hypervisor backend.
pub struct TartBackend {
    control: Arc<dyn TartControl>,
    config: RwLock<TartConfig>,
    /// VMs this backend started, keyed by id.
    running: Mutex<HashMap<String, RunningVm>>,
    /// VMs still being created; hidden from `list`.
    pending: Arc<Mutex<HashSet<String>>>,
}

struct RunningVm {
    image: String,
    handle: RunHandle,
}

/// Marks a VM as being created until dropped.
struct PendingGuard {
    pending: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

impl TartBackend {
    /// Backend driving the real `tart` binary.
    pub fn new() -> Self {
        Self::with_control(Arc::new(TartCli::new()))
    }

    pub fn with_control(control: Arc<dyn TartControl>) -> Self {
        info!("Creating Tart hypervisor backend");
        Self {
            control,
            config: RwLock::new(TartConfig::default()),
            running: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Replace the configuration with `bytes`, if non-empty.
    pub fn configure(&self, bytes: &[u8]) -> Result<()> {
        if let Some(cfg) = parse_backend_config::<TartConfig>(bytes)? {
            *self
                .config
                .write()
                .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))? = cfg;
        }
        Ok(())
    }

    pub fn config(&self) -> Result<TartConfig> {
        self.config
            .read()
            .map(|c| c.clone())
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    fn running(&self) -> Result<MutexGuard<'_, HashMap<String, RunningVm>>> {
        self.running
            .lock()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    fn mark_pending(&self, id: &str) -> Result<PendingGuard> {
        self.pending
            .lock()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?
            .insert(id.to_string());
        Ok(PendingGuard {
            pending: self.pending.clone(),
            id: id.to_string(),
        })
    }

    /// Boot a cloned VM and wait for its address.
    ///
    /// If the run process exits before an address shows up, the create fails.
    async fn start(&self, ctx: &Context, id: &str, timeout: Duration) -> Result<(RunHandle, String)> {
        let mut run = self.control.run_vm(id)?;

        let addr = tokio::select! {
            addr = self.control.vm_address(ctx, id, timeout) => addr,
            exit = run.wait() => {
                let reason = match exit {
                    Ok(()) => "exited".to_string(),
                    Err(e) => e.to_string(),
                };
                Err(HypervisorError::CreateFailed(format!(
                    "vm process ended before reporting an address: {}",
                    reason
                )))
            }
        };

        match addr {
            Ok(addr) => Ok((run, addr)),
            Err(e) => {
                if let Err(stop_err) = run.stop().await {
                    warn!(error = %stop_err, "Failed to stop vm process");
                }
                Err(e)
            }
        }
    }
}

impl Default for TartBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hypervisor for TartBackend {
    fn name(&self) -> &'static str {
        "tart"
    }

    #[instrument(skip(self, ctx, config))]
    async fn init(&self, ctx: &Context, config: &[u8]) -> Result<()> {
        ctx.check()?;
        self.configure(config)?;
        info!("Tart backend initialized");
        Ok(())
    }

    async fn shutdown(&self, _ctx: &Context) -> Result<()> {
        debug!("Tart backend has nothing to tear down");
        Ok(())
    }

    #[instrument(skip(self, ctx))]
    async fn create(&self, ctx: &Context, name: &str) -> Result<VirtualMachine> {
        ctx.check()?;

        let cfg = self.config()?;
        let id = vm_id();
        let _pending = self.mark_pending(&id)?;
        info!(vm_id = %id, "Creating VM");

        let mut rollback = Rollback::new();
        let result = async {
            self.control.clone_vm(ctx, name, &id).await?;

            let control = self.control.clone();
            let clone_id = id.clone();
            rollback.defer("delete clone", async move {
                let ctx = Context::background().with_timeout(CLEANUP_TIMEOUT);
                control.delete_vm(&ctx, &clone_id).await
            });

            self.start(ctx, &id, cfg.address_timeout()).await
        }
        .await;
        let (handle, addr) = rollback.finish(result).await?;

        self.running()?.insert(
            id.clone(),
            RunningVm {
                image: name.to_string(),
                handle,
            },
        );

        info!(vm_id = %id, %addr, "VM created");
        Ok(VirtualMachine::new(id, name).with_addr(addr))
    }

    #[instrument(skip(self, ctx), fields(vm_id = %id))]
    async fn delete(&self, ctx: &Context, id: &str) -> Result<()> {
        let running = self.running()?.remove(id);
        if let Some(vm) = running {
            if let Err(e) = vm.handle.stop().await {
                warn!(error = %e, "VM process did not stop cleanly");
            }
        }

        let raw = self
            .control
            .list_raw(ctx)
            .await
            .map_err(|e| e.wrap_with(|m| HypervisorError::QueryFailed(format!("fetching vm ({}) details: {}", id, m))))?;
        if !parse_vm_list(&raw, id).iter().any(|name| name == id) {
            return Err(HypervisorError::VmNotFound(id.to_string()));
        }

        self.control
            .delete_vm(ctx, id)
            .await
            .map_err(|e| e.wrap_with(|m| HypervisorError::DeleteFailed(format!("deleting vm ({}): {}", id, m))))?;

        info!("VM deleted");
        Ok(())
    }

    #[instrument(skip(self, ctx))]
    async fn list(&self, ctx: &Context) -> Result<Vec<VirtualMachine>> {
        let raw = self
            .control
            .list_raw(ctx)
            .await
            .map_err(|e| e.wrap_with(|m| HypervisorError::QueryFailed(format!("fetching list: {}", m))))?;

        let images: HashMap<String, String> = self
            .running()?
            .iter()
            .map(|(id, vm)| (id.clone(), vm.image.clone()))
            .collect();
        let pending: HashSet<String> = self
            .pending
            .lock()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?
            .clone();

        let mut vms = Vec::new();
        for id in parse_vm_list(&raw, VM_NAME_PREFIX) {
            if pending.contains(&id) {
                continue;
            }

            let addr = self
                .control
                .vm_address(ctx, &id, LIST_ADDRESS_TIMEOUT)
                .await
                .map_err(|e| e.wrap_with(|m| HypervisorError::QueryFailed(format!("getting {:?} addr: {}", id, m))))?;

            let image = images.get(&id).cloned().unwrap_or_default();
            vms.push(VirtualMachine::new(id, image).with_addr(addr));
        }

        Ok(vms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::oneshot;

    /// In-memory stand-in for the `tart` binary.
    #[derive(Default)]
    struct FakeTart {
        vms: Mutex<BTreeSet<String>>,
        calls: Mutex<Vec<String>>,
        /// The run process dies right after starting.
        crash_on_run: AtomicBool,
        /// `tart ip` never answers.
        no_address: AtomicBool,
        stops: Arc<AtomicU32>,
    }

    impl FakeTart {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TartControl for FakeTart {
        async fn clone_vm(&self, _ctx: &Context, image: &str, id: &str) -> Result<()> {
            self.record(format!("clone {} {}", image, id));
            self.vms.lock().unwrap().insert(id.to_string());
            Ok(())
        }

        fn run_vm(&self, id: &str) -> Result<RunHandle> {
            self.record(format!("run {}", id));
            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            let crash = self.crash_on_run.load(Ordering::SeqCst);
            let stops = self.stops.clone();
            let exit = tokio::spawn(async move {
                if crash {
                    return Err(HypervisorError::CommandFailed {
                        command: "tart run".to_string(),
                        message: "exit status: 1".to_string(),
                    });
                }
                let _ = stop_rx.await;
                stops.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(RunHandle::new(stop_tx, exit))
        }

        async fn vm_address(&self, ctx: &Context, id: &str, timeout: Duration) -> Result<String> {
            if self.no_address.load(Ordering::SeqCst) {
                ctx.sleep(timeout).await?;
                return Err(HypervisorError::QueryFailed(format!("no ip for {}", id)));
            }
            Ok("192.168.64.5".to_string())
        }

        async fn delete_vm(&self, _ctx: &Context, id: &str) -> Result<()> {
            self.record(format!("delete {}", id));
            self.vms.lock().unwrap().remove(id);
            Ok(())
        }

        async fn list_raw(&self, _ctx: &Context) -> Result<String> {
            let mut out = String::from("Source\tName\tState\n");
            out.push_str("oci\tghcr.io/cirruslabs/macos:latest\tstopped\n");
            for vm in self.vms.lock().unwrap().iter() {
                out.push_str(&format!("local\t{}\trunning\n", vm));
            }
            Ok(out)
        }
    }

    fn setup(fake: FakeTart) -> (TartBackend, Arc<FakeTart>) {
        let fake = Arc::new(fake);
        (TartBackend::with_control(fake.clone()), fake)
    }

    #[tokio::test]
    async fn test_create_list_delete() {
        let (backend, fake) = setup(FakeTart::default());
        let ctx = Context::background();
        backend.init(&ctx, b"").await.unwrap();

        let vm = backend.create(&ctx, "macos-sonoma").await.unwrap();
        assert!(vm.id.starts_with(VM_NAME_PREFIX));
        assert_eq!(vm.addr, "192.168.64.5");

        assert_eq!(backend.list(&ctx).await.unwrap(), vec![vm.clone()]);

        backend.delete(&ctx, &vm.id).await.unwrap();
        assert_eq!(fake.stops.load(Ordering::SeqCst), 1);
        assert!(backend.list(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_exit_fails_create_and_deletes_clone() {
        let (backend, fake) = setup(FakeTart {
            crash_on_run: AtomicBool::new(true),
            no_address: AtomicBool::new(true),
            ..Default::default()
        });
        let ctx = Context::background();

        let err = backend.create(&ctx, "macos-sonoma").await.unwrap_err();
        assert!(matches!(err, HypervisorError::CreateFailed(_)), "{:?}", err);

        let calls = fake.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[2].starts_with("delete nesting-"));
        assert!(fake.vms.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_address_failure_stops_run() {
        let (backend, fake) = setup(FakeTart {
            no_address: AtomicBool::new(true),
            ..Default::default()
        });
        let ctx = Context::background();
        backend.init(&ctx, b"address_timeout_secs: 5\n").await.unwrap();

        let err = backend.create(&ctx, "macos-sonoma").await.unwrap_err();
        assert!(matches!(err, HypervisorError::QueryFailed(_)), "{:?}", err);
        assert_eq!(fake.stops.load(Ordering::SeqCst), 1);
        assert!(fake.vms.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_unknown_vm() {
        let (backend, _fake) = setup(FakeTart::default());
        let err = backend
            .delete(&Context::background(), "nesting-missing0")
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::VmNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_fails_when_an_address_fails() {
        let (backend, fake) = setup(FakeTart::default());
        fake.vms.lock().unwrap().insert("nesting-leftover".to_string());
        fake.no_address.store(true, Ordering::SeqCst);

        assert!(backend.list(&Context::background()).await.is_err());
    }
}
