//! Compensating rollback for multi-step creation.
//!
//! Each side-effecting step of a create registers an undo action. If the
//! create fails the actions run newest first before the error is returned.
//! If the create future is dropped midway, for example because its task was
//! aborted, the pending actions are spawned onto the runtime instead.

use std::future::Future;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::Result;

struct Step {
    description: String,
    undo: BoxFuture<'static, Result<()>>,
}

/// Ordered list of undo actions.
#[derive(Default)]
#[must_use = "call `finish`, `run` or `disarm`; dropping runs the undo actions in the background"]
pub struct Rollback {
    steps: Vec<Step>,
}

impl Rollback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an undo action for a step that just succeeded.
    pub fn defer<F>(&mut self, description: impl Into<String>, undo: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.steps.push(Step {
            description: description.into(),
            undo: Box::pin(undo),
        });
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Forget every registered action. Used once the whole operation succeeded.
    pub fn disarm(mut self) {
        self.steps.clear();
    }

    /// Run every registered action, newest first.
    ///
    /// A failing action is logged and the remaining ones still run.
    pub async fn run(mut self) {
        run_steps(std::mem::take(&mut self.steps)).await;
    }

    /// Disarm on success, run on failure, and hand `result` back.
    pub async fn finish<T>(self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.disarm();
                Ok(value)
            }
            Err(e) => {
                debug!(error = %e, steps = self.len(), "Rolling back");
                self.run().await;
                Err(e)
            }
        }
    }
}

async fn run_steps(steps: Vec<Step>) {
    for step in steps.into_iter().rev() {
        if let Err(e) = step.undo.await {
            warn!(step = %step.description, error = %e, "Rollback step failed");
        } else {
            debug!(step = %step.description, "Rolled back");
        }
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if self.steps.is_empty() {
            return;
        }

        let steps = std::mem::take(&mut self.steps);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(steps = steps.len(), "Operation abandoned, rolling back in background");
                handle.spawn(run_steps(steps));
            }
            Err(_) => warn!(
                steps = steps.len(),
                "Operation abandoned outside a runtime, rollback skipped"
            ),
        }
    }
}
