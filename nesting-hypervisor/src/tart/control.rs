//! Thin wrapper over the `tart` command-line tool.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command;
use crate::context::Context;
use crate::error::{HypervisorError, Result};

const TART_CMD: &str = "tart";

/// A VM process supervised by the backend.
///
/// Dropping the handle stops the VM in the background; [`RunHandle::stop`]
/// stops it and waits for the process to exit.
pub struct RunHandle {
    stop: Option<oneshot::Sender<()>>,
    exit: Option<JoinHandle<Result<()>>>,
}

impl RunHandle {
    /// Wrap a supervisor task. The task must end when `stop` fires or is dropped.
    pub fn new(stop: oneshot::Sender<()>, exit: JoinHandle<Result<()>>) -> Self {
        Self {
            stop: Some(stop),
            exit: Some(exit),
        }
    }

    /// Resolves when the VM process exits on its own.
    ///
    /// Resolves immediately if the exit was already observed.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(exit) = self.exit.as_mut() else {
            return Ok(());
        };
        let result = exit.await;
        self.exit = None;
        flatten(result)
    }

    /// Stop the VM process and wait for it to exit.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.exit.take() {
            Some(exit) => flatten(exit.await),
            None => Ok(()),
        }
    }
}

fn flatten(result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    result.map_err(|e| HypervisorError::Internal(format!("vm supervisor failed: {}", e)))?
}

/// Operations the Tart backend needs from the host.
#[async_trait]
pub trait TartControl: Send + Sync {
    /// Clone image `image` into a new local VM named `id`.
    async fn clone_vm(&self, ctx: &Context, image: &str, id: &str) -> Result<()>;

    /// Start VM `id` under supervision.
    fn run_vm(&self, id: &str) -> Result<RunHandle>;

    /// Wait up to `timeout` for VM `id` to report an address.
    async fn vm_address(&self, ctx: &Context, id: &str, timeout: Duration) -> Result<String>;

    async fn delete_vm(&self, ctx: &Context, id: &str) -> Result<()>;

    /// Raw `tart list` output.
    async fn list_raw(&self, ctx: &Context) -> Result<String>;
}

/// [`TartControl`] backed by the `tart` binary.
#[derive(Debug, Clone, Default)]
pub struct TartCli;

impl TartCli {
    pub fn new() -> Self {
        Self
    }
}

/// Names of local VMs starting with `prefix`, from tab-separated `tart list`
/// output.
///
/// The first line is the header and locates the `Source` and `Name` columns.
/// Lines with a different column count are ignored, and cells are trimmed.
pub fn parse_vm_list(raw: &str, prefix: &str) -> Vec<String> {
    let mut lines = raw.lines().filter(|l| !l.trim().is_empty());

    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let columns = split_record(header);
    let mut source_idx = 0;
    let mut name_idx = 0;
    for (idx, column) in columns.iter().enumerate() {
        match column.to_lowercase().as_str() {
            "source" => source_idx = idx,
            "name" => name_idx = idx,
            _ => {}
        }
    }

    lines
        .map(split_record)
        .filter(|record| record.len() == columns.len())
        .filter(|record| record[source_idx] == "local")
        .filter(|record| record[name_idx].starts_with(prefix))
        .map(|record| record[name_idx].to_string())
        .collect()
}

fn split_record(line: &str) -> Vec<&str> {
    line.split('\t')
        .filter(|cell| !cell.is_empty())
        .map(str::trim)
        .collect()
}

#[async_trait]
impl TartControl for TartCli {
    async fn clone_vm(&self, ctx: &Context, image: &str, id: &str) -> Result<()> {
        command::run(ctx, TART_CMD, &["clone", image, id])
            .await
            .map_err(|e| e.wrap_with(|m| HypervisorError::CreateFailed(format!("cloning image {} ({}): {}", id, image, m))))?;
        Ok(())
    }

    fn run_vm(&self, id: &str) -> Result<RunHandle> {
        let args = ["run", id, "--no-graphics", "--with-softnet"];
        let command_line = command::command_line(TART_CMD, &args);

        let mut child = Command::new(TART_CMD)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HypervisorError::CommandFailed {
                command: command_line.clone(),
                message: e.to_string(),
            })?;

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let vm_id = id.to_string();
        let exit = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let status = status.map_err(|e| HypervisorError::CommandFailed {
                        command: command_line.clone(),
                        message: e.to_string(),
                    })?;
                    warn!(vm_id = %vm_id, %status, "VM process exited");
                    if status.success() {
                        Ok(())
                    } else {
                        Err(HypervisorError::CommandFailed {
                            command: command_line,
                            message: status.to_string(),
                        })
                    }
                }
                // Fires on an explicit stop and when the handle is dropped.
                _ = stop_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(vm_id = %vm_id, error = %e, "Failed to kill VM process");
                    }
                    debug!(vm_id = %vm_id, "VM process stopped");
                    Ok(())
                }
            }
        });

        info!(vm_id = %id, "VM process started");
        Ok(RunHandle::new(stop_tx, exit))
    }

    async fn vm_address(&self, ctx: &Context, id: &str, timeout: Duration) -> Result<String> {
        let wait = timeout.as_secs().to_string();
        let out = command::run(ctx, TART_CMD, &["ip", id, "--wait", &wait])
            .await
            .map_err(|e| e.wrap_with(|m| HypervisorError::QueryFailed(format!("fetching address: {}", m))))?;
        Ok(out.trim().to_string())
    }

    async fn delete_vm(&self, ctx: &Context, id: &str) -> Result<()> {
        command::run(ctx, TART_CMD, &["delete", id])
            .await
            .map_err(|e| e.wrap_with(|m| HypervisorError::DeleteFailed(format!("deleting image: {}", m))))?;
        Ok(())
    }

    async fn list_raw(&self, ctx: &Context) -> Result<String> {
        command::run(ctx, TART_CMD, &["list"]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "nesting-";

    fn list(lines: &[&str]) -> Vec<String> {
        parse_vm_list(&lines.join("\n"), PREFIX)
    }

    #[test]
    fn test_empty_list() {
        assert!(list(&[]).is_empty());
    }

    #[test]
    fn test_only_headers() {
        assert!(list(&["Source\tName"]).is_empty());
    }

    #[test]
    fn test_multiple_vms() {
        assert_eq!(
            list(&[
                "Source\tName",
                "local\tnesting-abc",
                "local\tnesting-def",
                "local\tnesting-geh",
            ]),
            vec!["nesting-abc", "nesting-def", "nesting-geh"]
        );
    }

    #[test]
    fn test_ignores_non_local_images() {
        assert_eq!(
            list(&["Source\tName", "oci\tnesting-not-your-vm", "local\tnesting-abc"]),
            vec!["nesting-abc"]
        );
    }

    #[test]
    fn test_ignores_garbage() {
        assert_eq!(
            list(&["Source\tName", "local\tnesting-abc", "garbage!", "local\tnesting-def"]),
            vec!["nesting-abc", "nesting-def"]
        );
    }

    #[test]
    fn test_ignores_other_prefixes() {
        assert_eq!(
            list(&["Source\tName", "local\tnesting-abc", "local\tresting-def", "local\ttesting-geh"]),
            vec!["nesting-abc"]
        );
    }

    #[test]
    fn test_spaces_in_weird_places() {
        assert_eq!(
            list(&[
                "source \tname ",
                "local \tnesting-abc ",
                " local\t nesting-def",
                " local \t nesting-geh ",
            ]),
            vec!["nesting-abc", "nesting-def", "nesting-geh"]
        );
    }

    #[test]
    fn test_extra_columns() {
        assert_eq!(
            list(&[
                "Source\tName\tDisk\tSize\tState",
                "local\tnesting-abc\t50\t20\trunning",
                "local\tnesting-def\t50",
            ]),
            vec!["nesting-abc"]
        );
    }

    #[tokio::test]
    async fn test_dropping_run_handle_stops_supervisor() {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let exit = tokio::spawn(async move {
            let _ = stop_rx.await;
            let _ = done_tx.send(());
            Ok(())
        });

        drop(RunHandle::new(stop_tx, exit));
        done_rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_reports_early_exit() {
        let (stop_tx, _stop_rx) = oneshot::channel::<()>();
        let exit = tokio::spawn(async {
            Err(HypervisorError::CommandFailed {
                command: "tart run".to_string(),
                message: "exit status: 1".to_string(),
            })
        });

        let mut handle = RunHandle::new(stop_tx, exit);
        assert!(handle.wait().await.is_err());
        // Already observed: returns straight away.
        assert!(handle.wait().await.is_ok());
        assert!(handle.stop().await.is_ok());
    }
}
