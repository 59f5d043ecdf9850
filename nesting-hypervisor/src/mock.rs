//! Mock hypervisor backend for testing and development.
//!
//! [`MockBackend`] is the real [`FrameworkBackend`] driving an in-process
//! [`SimulatedEngine`], so it exercises the same pool, rollback and state
//! handling as a hardware-backed framework driver without needing one.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

use crate::error::{HypervisorError, Result};
use crate::framework::{BootSpec, FrameworkBackend, FrameworkConfig, MachineEngine};
use crate::machine::{Machine, MachineState};

/// Framework backend running simulated machines.
pub type MockBackend = FrameworkBackend<SimulatedEngine>;

impl MockBackend {
    /// Mock backend with default settings.
    pub fn simulated() -> Self {
        FrameworkBackend::new(SimulatedEngine::new())
    }

    /// Mock backend with explicit settings.
    pub fn simulated_with_config(config: FrameworkConfig) -> Self {
        FrameworkBackend::with_config(SimulatedEngine::new(), config)
    }
}

/// Engine that "boots" machines by walking them through the state machine
/// on timers.
///
/// Useful for:
/// - Unit and integration testing
/// - Development on hosts without a virtualization framework
pub struct SimulatedEngine {
    boot_delay: Duration,
    shutdown_delay: Duration,
    graceful: bool,
    failing_images: RwLock<HashSet<String>>,
    next_port: AtomicU16,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        info!("Creating simulated machine engine");
        Self {
            boot_delay: Duration::from_millis(20),
            shutdown_delay: Duration::from_millis(20),
            graceful: true,
            failing_images: RwLock::new(HashSet::new()),
            next_port: AtomicU16::new(2222),
        }
    }

    /// Time spent in `starting` (and `stopping`).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.boot_delay = delay;
        self.shutdown_delay = delay;
        self
    }

    /// Whether guests honor a graceful stop request.
    pub fn with_graceful_stop(mut self, graceful: bool) -> Self {
        self.graceful = graceful;
        self
    }

    /// Machines booted from `image` end up in the `error` state.
    pub fn fail_image(&self, image: impl Into<String>) -> Result<()> {
        self.failing_images
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?
            .insert(image.into());
        Ok(())
    }

    fn will_fail(&self, image: &str) -> Result<bool> {
        Ok(self
            .failing_images
            .read()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?
            .contains(image))
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MachineEngine for SimulatedEngine {
    type Machine = SimulatedMachine;

    fn name(&self) -> &'static str {
        "mock"
    }

    #[instrument(skip(self, spec), fields(vm_id = %spec.id, image = %spec.image))]
    async fn boot(&self, spec: &BootSpec) -> Result<SimulatedMachine> {
        // Stand-in for the cloned disk so the working directory has content.
        tokio::fs::write(spec.work_dir.join("disk.img"), spec.image.as_bytes())
            .await
            .map_err(|e| HypervisorError::CreateFailed(format!("writing disk image: {}", e)))?;

        let fails = self.will_fail(&spec.image)?;
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let (state, _) = watch::channel(MachineState::Starting);
        let state = Arc::new(state);

        let booting = state.clone();
        let delay = self.boot_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let next = if fails { MachineState::Error } else { MachineState::Running };
            booting.send_if_modified(|current| {
                if current.can_transition_to(next) {
                    *current = next;
                    true
                } else {
                    false
                }
            });
        });

        debug!(port, "Simulated machine starting");
        Ok(SimulatedMachine {
            state,
            addr: format!("127.0.0.1:{}", port),
            graceful: self.graceful,
            shutdown_delay: self.shutdown_delay,
        })
    }
}

/// A machine produced by [`SimulatedEngine`].
pub struct SimulatedMachine {
    state: Arc<watch::Sender<MachineState>>,
    addr: String,
    graceful: bool,
    shutdown_delay: Duration,
}

impl SimulatedMachine {
    fn current(&self) -> MachineState {
        *self.state.borrow()
    }
}

#[async_trait]
impl Machine for SimulatedMachine {
    fn address(&self) -> String {
        self.addr.clone()
    }

    fn subscribe(&self) -> watch::Receiver<MachineState> {
        self.state.subscribe()
    }

    fn can_stop(&self) -> bool {
        matches!(self.current(), MachineState::Starting | MachineState::Running)
    }

    async fn stop(&self) -> Result<()> {
        if !self.can_stop() {
            return Err(HypervisorError::Internal(format!(
                "cannot stop machine in state {}",
                self.current()
            )));
        }
        self.state.send_replace(MachineState::Stopped);
        debug!("Simulated machine powered off");
        Ok(())
    }

    fn can_request_stop(&self) -> bool {
        self.current() == MachineState::Running
    }

    async fn request_stop(&self) -> Result<bool> {
        if !self.graceful {
            // The guest acknowledges and then ignores the request.
            return Ok(true);
        }

        self.state.send_replace(MachineState::Stopping);
        let state = self.state.clone();
        let delay = self.shutdown_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            state.send_replace(MachineState::Stopped);
        });
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::traits::Hypervisor;

    fn backend(dir: &std::path::Path, max_machines: usize) -> MockBackend {
        MockBackend::simulated_with_config(FrameworkConfig {
            image_directory: dir.join("images"),
            working_directory: dir.join("data"),
            max_machines,
            graceful_stop_timeout_secs: 1,
        })
    }

    #[tokio::test]
    async fn test_vm_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), 2);
        let ctx = Context::background();

        backend.init(&ctx, b"").await.unwrap();

        let vm = backend.create(&ctx, "macos-14").await.unwrap();
        assert!(vm.id.starts_with("nesting-"));
        assert_eq!(vm.name, "macos-14");
        assert!(vm.has_addr());
        assert!(dir.path().join("data").join(&vm.id).join("disk.img").exists());

        let vms = backend.list(&ctx).await.unwrap();
        assert_eq!(vms, vec![vm.clone()]);
        assert_eq!(backend.pool().available().unwrap(), 1);

        backend.delete(&ctx, &vm.id).await.unwrap();
        assert!(backend.list(&ctx).await.unwrap().is_empty());
        assert!(!dir.path().join("data").join(&vm.id).exists());
        assert_eq!(backend.pool().available().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(backend(dir.path(), 1));
        let ctx = Context::background();
        backend.init(&ctx, b"").await.unwrap();

        let (a, b) = tokio::join!(
            backend.create(&ctx, "ubuntu"),
            backend.create(&ctx, "ubuntu")
        );

        let results = [a, b];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Err(HypervisorError::ResourceExhausted(_))))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(exhausted, 1);
    }

    #[tokio::test]
    async fn test_boot_error_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), 1);
        let ctx = Context::background();
        backend.init(&ctx, b"").await.unwrap();
        backend.engine().fail_image("broken").unwrap();

        let err = backend.create(&ctx, "broken").await.unwrap_err();
        assert!(matches!(err, HypervisorError::CreateFailed(_)));

        // Nothing leaked: network back in the pool, no working directory left.
        assert_eq!(backend.pool().available().unwrap(), 1);
        assert!(backend.list(&ctx).await.unwrap().is_empty());
        let leftovers = std::fs::read_dir(dir.path().join("data")).unwrap().count();
        assert_eq!(leftovers, 0);

        // The pool entry is usable again.
        backend.create(&ctx, "ubuntu").await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_create_tears_down_before_returning_network() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FrameworkBackend::with_config(
            SimulatedEngine::new().with_delay(Duration::from_secs(5)),
            FrameworkConfig {
                image_directory: dir.path().join("images"),
                working_directory: dir.path().join("data"),
                max_machines: 1,
                graceful_stop_timeout_secs: 1,
            },
        );
        let ctx = Context::background();
        backend.init(&ctx, b"").await.unwrap();

        let abandoned = tokio::time::timeout(Duration::from_millis(200), backend.create(&ctx, "ubuntu")).await;
        assert!(abandoned.is_err());

        // The half-booted machine still holds its network.
        assert_eq!(backend.pool().available().unwrap(), 0);
        assert!(matches!(
            backend.create(&ctx, "ubuntu").await,
            Err(HypervisorError::ResourceExhausted(_))
        ));

        for _ in 0..100 {
            if backend.pool().available().unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(backend.pool().available().unwrap(), 1);
        let leftovers = std::fs::read_dir(dir.path().join("data")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_delete_escalates_when_guest_ignores_stop() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SimulatedEngine::new().with_graceful_stop(false);
        let backend = FrameworkBackend::with_config(
            engine,
            FrameworkConfig {
                image_directory: dir.path().join("images"),
                working_directory: dir.path().join("data"),
                max_machines: 1,
                graceful_stop_timeout_secs: 0,
            },
        );
        let ctx = Context::background();
        backend.init(&ctx, b"").await.unwrap();

        let vm = backend.create(&ctx, "ubuntu").await.unwrap();
        backend.delete(&ctx, &vm.id).await.unwrap();
        assert!(backend.list(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_unknown_vm() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), 1);
        let ctx = Context::background();
        backend.init(&ctx, b"").await.unwrap();

        let err = backend.delete(&ctx, "nesting-missing0").await.unwrap_err();
        assert!(matches!(err, HypervisorError::VmNotFound(_)));
    }

    #[tokio::test]
    async fn test_init_config_overrides_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), 1);
        let config = format!(
            "working_directory: {}\nmax_machines: 3\n",
            dir.path().join("other").display()
        );

        backend.init(&Context::background(), config.as_bytes()).await.unwrap();

        assert_eq!(backend.pool().capacity().unwrap(), 3);
        assert!(dir.path().join("other").is_dir());
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_machines() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), 2);
        let ctx = Context::background();
        backend.init(&ctx, b"").await.unwrap();
        backend.create(&ctx, "a").await.unwrap();
        backend.create(&ctx, "b").await.unwrap();

        backend.shutdown(&ctx).await.unwrap();

        assert!(backend.list(&ctx).await.unwrap().is_empty());
        assert_eq!(backend.pool().available().unwrap(), 2);
    }
}
