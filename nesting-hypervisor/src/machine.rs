//! Run-state machine for frameworks that report explicit VM state.
//!
//! ```text
//! pre-start ──► starting ──► running ──► stopping ──► stopped
//!                  │            │                        ▲
//!                  ▼            └────────────────────────┘
//!                error
//! ```
//!
//! Create waits until `running` is observed. Delete asks the guest to stop,
//! falls back to a forced stop, and waits for `stopped` before any resource
//! tied to the VM is released.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{HypervisorError, Result};

/// Interval between stop attempts while a machine refuses both stop kinds.
pub const STOP_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Observable run state of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MachineState {
    PreStart,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::PreStart => "pre-start",
            MachineState::Starting => "starting",
            MachineState::Running => "running",
            MachineState::Stopping => "stopping",
            MachineState::Stopped => "stopped",
            MachineState::Error => "error",
        }
    }

    /// No further transitions happen from here.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MachineState::Stopped | MachineState::Error)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: MachineState) -> bool {
        use MachineState::*;
        matches!(
            (self, next),
            (PreStart, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Running, Error)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A booted machine driven by a virtualization framework.
#[async_trait]
pub trait Machine: Send + Sync {
    /// Address callers use to reach the guest.
    fn address(&self) -> String;

    /// Stream of state changes. The current value is the current state.
    fn subscribe(&self) -> watch::Receiver<MachineState>;

    fn state(&self) -> MachineState {
        *self.subscribe().borrow()
    }

    /// Whether a forced stop is possible right now.
    fn can_stop(&self) -> bool;

    /// Power the machine off.
    async fn stop(&self) -> Result<()>;

    /// Whether the guest can be asked to shut down right now.
    fn can_request_stop(&self) -> bool;

    /// Ask the guest to shut down. `Ok(false)` means the request was refused.
    async fn request_stop(&self) -> Result<bool>;
}

/// Block until the machine is running.
///
/// Fails if the machine enters `error` or `stopped` first, or if the state
/// stream closes.
pub async fn wait_until_running(ctx: &Context, states: &mut watch::Receiver<MachineState>) -> Result<()> {
    loop {
        let state = *states.borrow_and_update();
        match state {
            MachineState::Running => return Ok(()),
            MachineState::Error => {
                return Err(HypervisorError::CreateFailed("internal VM error".to_string()))
            }
            MachineState::Stopped => {
                return Err(HypervisorError::CreateFailed("virtual machine stopped".to_string()))
            }
            other => debug!(state = %other, "Waiting for machine to run"),
        }

        tokio::select! {
            e = ctx.done() => return Err(e),
            changed = states.changed() => {
                if changed.is_err() {
                    return Err(HypervisorError::CreateFailed(
                        "state stream ended before the machine was running".to_string(),
                    ));
                }
            }
        }
    }
}

/// Block until the machine reaches a terminal state.
pub async fn wait_until_stopped(ctx: &Context, states: &mut watch::Receiver<MachineState>) -> Result<()> {
    loop {
        if states.borrow_and_update().is_terminal() {
            return Ok(());
        }

        tokio::select! {
            e = ctx.done() => return Err(e),
            changed = states.changed() => {
                // Nobody left to report state: the machine is gone.
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Stop a machine, gracefully if possible.
///
/// The guest gets `graceful_timeout` to shut itself down. After that, or
/// when a graceful stop is not possible, the machine is powered off. Returns
/// once the machine is fully stopped.
pub async fn stop_machine<M>(ctx: &Context, machine: &M, graceful_timeout: Duration) -> Result<()>
where
    M: Machine + ?Sized,
{
    let mut states = machine.subscribe();
    if states.borrow().is_terminal() {
        return Ok(());
    }

    if machine.can_request_stop() && machine.request_stop().await? {
        debug!(timeout_secs = graceful_timeout.as_secs(), "Graceful stop requested");
        match tokio::time::timeout(graceful_timeout, wait_until_stopped(ctx, &mut states)).await {
            Ok(Ok(())) => {
                info!("Machine stopped gracefully");
                return Ok(());
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => warn!("Graceful stop timed out, forcing"),
        }
    }

    loop {
        ctx.check()?;

        let state = *states.borrow();
        if state.is_terminal() {
            break;
        }
        if machine.can_stop() {
            machine.stop().await?;
            break;
        }
        if state == MachineState::Stopping {
            break;
        }

        ctx.sleep(STOP_RETRY_INTERVAL).await?;
    }

    wait_until_stopped(ctx, &mut states).await?;
    info!("Machine stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Machine whose state is driven directly by the test.
    struct Scripted {
        state: Arc<watch::Sender<MachineState>>,
        graceful: bool,
        stops: AtomicU32,
    }

    impl Scripted {
        fn new(state: MachineState, graceful: bool) -> Arc<Self> {
            let (state, _) = watch::channel(state);
            Arc::new(Self {
                state: Arc::new(state),
                graceful,
                stops: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Machine for Scripted {
        fn address(&self) -> String {
            "127.0.0.1:2222".to_string()
        }

        fn subscribe(&self) -> watch::Receiver<MachineState> {
            self.state.subscribe()
        }

        fn can_stop(&self) -> bool {
            !self.state.borrow().is_terminal()
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.state.send_replace(MachineState::Stopped);
            Ok(())
        }

        fn can_request_stop(&self) -> bool {
            *self.state.borrow() == MachineState::Running
        }

        async fn request_stop(&self) -> Result<bool> {
            if self.graceful {
                self.state.send_replace(MachineState::Stopping);
                let state = self.state.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    state.send_replace(MachineState::Stopped);
                });
            }
            Ok(true)
        }
    }

    #[test]
    fn test_transitions() {
        use MachineState::*;
        assert!(PreStart.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Error));
        assert!(!Error.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Starting));
        assert!(Error.is_terminal());
        assert_eq!(PreStart.to_string(), "pre-start");
    }

    #[tokio::test]
    async fn test_wait_until_running() {
        let machine = Scripted::new(MachineState::Starting, true);
        let mut states = machine.subscribe();

        let sender = machine.clone();
        tokio::spawn(async move {
            sender.state.send_replace(MachineState::Running);
        });

        wait_until_running(&Context::background(), &mut states).await.unwrap();
    }

    #[tokio::test]
    async fn test_error_state_fails_create() {
        let machine = Scripted::new(MachineState::Starting, true);
        let mut states = machine.subscribe();
        machine.state.send_replace(MachineState::Error);

        let err = wait_until_running(&Context::background(), &mut states).await.unwrap_err();
        assert!(matches!(err, HypervisorError::CreateFailed(_)));
    }

    #[tokio::test]
    async fn test_closed_stream_fails_create() {
        let (tx, mut rx) = watch::channel(MachineState::Starting);
        drop(tx);
        let err = wait_until_running(&Context::background(), &mut rx).await.unwrap_err();
        assert!(matches!(err, HypervisorError::CreateFailed(_)));
    }

    #[tokio::test]
    async fn test_graceful_stop_needs_no_force() {
        let machine = Scripted::new(MachineState::Running, true);
        stop_machine(&Context::background(), machine.as_ref(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(machine.state(), MachineState::Stopped);
        assert_eq!(machine.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_graceful_stop_escalates() {
        let machine = Scripted::new(MachineState::Running, false);
        stop_machine(&Context::background(), machine.as_ref(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(machine.state(), MachineState::Stopped);
        assert_eq!(machine.stops.load(Ordering::SeqCst), 1);
    }
}
