//! Running external control tools (`prlctl`, `tart`, ...).

use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, trace};

use crate::context::Context;
use crate::error::{HypervisorError, Result};

/// Run `program args...` and return its stdout.
///
/// The child is killed if the context ends first. A non-zero exit becomes
/// [`HypervisorError::CommandFailed`] carrying the exit status and stderr.
pub async fn run(ctx: &Context, program: &str, args: &[&str]) -> Result<String> {
    let command_line = command_line(program, args);
    debug!(command = %command_line, "Running command");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| HypervisorError::CommandFailed {
            command: program.to_string(),
            message: e.to_string(),
        })?;

    let output = ctx
        .run(async {
            child.wait_with_output().await.map_err(|e| HypervisorError::CommandFailed {
                command: command_line.clone(),
                message: e.to_string(),
            })
        })
        .await?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(HypervisorError::CommandFailed {
            command: command_line,
            message: format!("{} ({})", output.status, stderr.trim()),
        });
    }

    trace!(command = %command_line, bytes = stdout.len(), "Command finished");
    Ok(stdout)
}

pub(crate) fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}
