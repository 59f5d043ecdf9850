//! Subcommand implementations.

use anyhow::{Context as _, Result};
use std::path::{Path, PathBuf};
use tracing::info;

use nesting_node::config::{read_backend_config, ServeConfig};
use nesting_node::server::{self, shutdown_signal};
use nesting_node::{Client, HypervisorKind};

/// Run the daemon until SIGINT or SIGTERM.
pub async fn serve(socket_path: PathBuf, hypervisor: Option<HypervisorKind>, config: Option<&Path>) -> Result<()> {
    let config = ServeConfig {
        hypervisor: hypervisor.unwrap_or_default(),
        socket_path,
        backend_config: read_backend_config(config)?,
        ..ServeConfig::default()
    };

    info!(
        hypervisor = %config.hypervisor,
        socket = %config.socket_path.display(),
        "Starting nesting daemon"
    );
    server::run(config, shutdown_signal()).await
}

pub async fn init(client: &Client, config: Option<&Path>) -> Result<()> {
    let config = read_backend_config(config)?;
    client.init(config).await.context("init")
}

pub async fn create(client: &Client, name: &str, slot: Option<i32>) -> Result<()> {
    let (vm, stomped) = client.create(name, slot).await.context("create")?;

    println!("{} {} {}", vm.id, vm.name, vm.addr);
    if let Some(id) = stomped {
        println!("stomped vm id {:?}", id);
    }
    Ok(())
}

pub async fn delete(client: &Client, id: &str) -> Result<()> {
    client.delete(id).await.context("delete")
}

pub async fn list(client: &Client) -> Result<()> {
    for vm in client.list().await.context("list")? {
        println!("{} {} {}", vm.id, vm.name, vm.addr);
    }
    Ok(())
}

pub async fn shutdown(client: &Client) -> Result<()> {
    client.shutdown().await.context("shutdown")
}

pub fn version() {
    println!("{}", env!("CARGO_PKG_VERSION"));
}
