//! Thin wrapper over the Parallels command-line tools.

use std::future::Future;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::command;
use crate::context::Context;
use crate::error::{HypervisorError, Result};

const CONTROL_CMD: &str = "prlctl";
const SERVER_CONTROL_CMD: &str = "prlsrvctl";

/// Parameters of a new linked clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    /// Name of the new VM
    pub id: String,
    /// `<image_directory>/<image>.pvm`
    pub image_path: PathBuf,
    pub working_dir: PathBuf,
    /// Compact hex MAC address
    pub mac: String,
    /// Host-only network to attach
    pub network: String,
}

impl CreateOptions {
    /// Name the image is registered under.
    pub fn image_name(&self) -> String {
        self.image_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// One entry of `prlctl list -a -i -j`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VmListItem {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Description", default)]
    pub description: String,
    #[serde(rename = "Hardware", default)]
    pub hardware: Hardware,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Hardware {
    #[serde(default)]
    pub net0: NetworkAdapter,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NetworkAdapter {
    #[serde(default)]
    pub iface: String,
    #[serde(default)]
    pub mac: String,
}

/// Operations the Parallels backend needs from the host.
#[async_trait]
pub trait ParallelsControl: Send + Sync {
    async fn install_license(&self, ctx: &Context, key: &str) -> Result<()>;

    /// Deactivate the license. Already deactivated is not an error.
    async fn remove_license(&self, ctx: &Context) -> Result<()>;

    /// Host-only networks whose id starts with `prefix`.
    async fn network_list(&self, ctx: &Context, prefix: &str) -> Result<Vec<String>>;

    /// Clone, configure and start a VM.
    async fn vm_create(&self, ctx: &Context, opts: &CreateOptions) -> Result<()>;

    /// Kill and delete a VM.
    async fn vm_delete(&self, ctx: &Context, name: &str) -> Result<()>;

    /// VMs whose name starts with `prefix`.
    async fn vm_list(&self, ctx: &Context, prefix: &str) -> Result<Vec<VmListItem>>;
}

/// [`ParallelsControl`] backed by `prlctl` and `prlsrvctl`.
#[derive(Debug, Clone, Default)]
pub struct PrlctlControl;

impl PrlctlControl {
    pub fn new() -> Self {
        Self
    }
}

/// Messages `prlsrvctl deactivate-license` prints when there is nothing to
/// deactivate.
fn is_not_activated(message: &str) -> bool {
    message.contains("deactivate the license") || message.contains("product could not be activated")
}

/// Parse `prlctl list -a -i -j` output and keep names starting with `prefix`.
pub fn parse_vm_list(raw: &str, prefix: &str) -> Result<Vec<VmListItem>> {
    let items: Vec<VmListItem> = serde_json::from_str(raw)
        .map_err(|e| HypervisorError::QueryFailed(format!("decoding vm list: {}", e)))?;
    Ok(items.into_iter().filter(|i| i.name.starts_with(prefix)).collect())
}

/// Parse `prlsrvctl net list -j` output and keep ids starting with `prefix`.
pub fn parse_network_list(raw: &str, prefix: &str) -> Result<Vec<String>> {
    #[derive(Deserialize)]
    struct Entry {
        #[serde(rename = "Network ID")]
        network_id: String,
    }

    let entries: Vec<Entry> = serde_json::from_str(raw)
        .map_err(|e| HypervisorError::QueryFailed(format!("decoding network list: {}", e)))?;
    Ok(entries
        .into_iter()
        .map(|e| e.network_id)
        .filter(|id| id.starts_with(prefix))
        .collect())
}

#[async_trait]
impl ParallelsControl for PrlctlControl {
    async fn install_license(&self, ctx: &Context, key: &str) -> Result<()> {
        command::run(ctx, SERVER_CONTROL_CMD, &["install-license", "-k", key])
            .await
            .map_err(|e| e.wrap_with(|_| HypervisorError::InvalidConfig("failed to install license".to_string())))?;
        info!("Parallels license installed");
        Ok(())
    }

    async fn remove_license(&self, ctx: &Context) -> Result<()> {
        match command::run(ctx, SERVER_CONTROL_CMD, &["deactivate-license"]).await {
            Ok(_) => {
                info!("Parallels license deactivated");
                Ok(())
            }
            Err(HypervisorError::CommandFailed { message, .. }) if is_not_activated(&message) => {
                debug!("Parallels license was not active");
                Ok(())
            }
            Err(e) => Err(e.wrap_with(|m| HypervisorError::Internal(format!("failed to remove license: {}", m)))),
        }
    }

    async fn network_list(&self, ctx: &Context, prefix: &str) -> Result<Vec<String>> {
        let raw = command::run(ctx, SERVER_CONTROL_CMD, &["net", "list", "-j"]).await?;
        parse_network_list(&raw, prefix)
    }

    async fn vm_create(&self, ctx: &Context, opts: &CreateOptions) -> Result<()> {
        let image = opts.image_name();
        let image_path = opts.image_path.to_string_lossy();
        let working_dir = opts.working_dir.to_string_lossy();

        // Registering an image that is already registered fails; that is fine.
        if let Err(e) = command::run(ctx, CONTROL_CMD, &["register", &image_path]).await {
            if e.is_cancellation() {
                return Err(e);
            }
            debug!(image = %image, error = %e, "Image register skipped");
        }

        command::run(
            ctx,
            CONTROL_CMD,
            &["clone", &image, "--name", &opts.id, "--linked", "--dst", &working_dir],
        )
        .await
        .map_err(|e| e.wrap_with(|m| HypervisorError::CreateFailed(format!("cloning image {} ({}): {}", opts.id, image, m))))?;

        command::run(ctx, CONTROL_CMD, &["set", &opts.id, "--description", &image])
            .await
            .map_err(|e| e.wrap_with(|m| HypervisorError::CreateFailed(format!("updating settings of {}: {}", opts.id, m))))?;

        command::run(
            ctx,
            CONTROL_CMD,
            &[
                "set", &opts.id,
                "--device-set", "net0",
                "--type", "host-only",
                "--iface", &opts.network,
                "--adapter-type", "virtio",
                "--mac", &opts.mac,
            ],
        )
        .await
        .map_err(|e| e.wrap_with(|m| HypervisorError::CreateFailed(format!("attaching network to {}: {}", opts.id, m))))?;

        command::run(ctx, CONTROL_CMD, &["start", &opts.id])
            .await
            .map_err(|e| e.wrap_with(|m| HypervisorError::CreateFailed(format!("starting {}: {}", opts.id, m))))?;

        Ok(())
    }

    async fn vm_delete(&self, ctx: &Context, name: &str) -> Result<()> {
        kill_and_delete(
            name,
            command::run(ctx, CONTROL_CMD, &["stop", name, "--kill"]),
            command::run(ctx, CONTROL_CMD, &["delete", name]),
        )
        .await
    }

    async fn vm_list(&self, ctx: &Context, prefix: &str) -> Result<Vec<VmListItem>> {
        let raw = command::run(ctx, CONTROL_CMD, &["list", "-a", "-i", "-j"]).await?;
        parse_vm_list(&raw, prefix)
    }
}

/// Run `stop`, then `delete`.
///
/// `prlctl stop` fails on a VM that is not running, which covers a clone
/// that never started and a VM a previous delete already stopped. Only
/// `delete` decides the outcome.
async fn kill_and_delete<S, D>(name: &str, stop: S, delete: D) -> Result<()>
where
    S: Future<Output = Result<String>>,
    D: Future<Output = Result<String>>,
{
    match stop.await {
        Ok(_) => {}
        Err(e) if e.is_cancellation() => return Err(e),
        Err(e) => warn!(vm = %name, error = %e, "Stop failed, deleting anyway"),
    }

    delete
        .await
        .map_err(|e| e.wrap_with(|m| HypervisorError::DeleteFailed(format!("deleting {}: {}", name, m))))?;
    Ok(())
}
