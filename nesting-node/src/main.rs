//! # nesting
//!
//! Daemon and command-line client for short-lived, slot-addressed VMs.
//!
//! ## Usage
//! ```bash
//! nesting serve --hypervisor parallels --config /etc/nesting/parallels.yaml
//! nesting init
//! nesting create macos-14-xcode 0
//! nesting list
//! nesting delete nesting-k3j9x0pq
//! nesting shutdown
//! ```

use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tracing::error;

mod cli;
mod commands;

use cli::{Args, Command};
use nesting_node::socket::default_socket_path;
use nesting_node::Client;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.log_json {
        nesting_common::init_logging_json(&args.log_level)?;
    } else {
        nesting_common::init_logging(&args.log_level)?;
    }

    let socket_path = args.socket.clone().unwrap_or_else(default_socket_path);
    let mut client = Client::new(&socket_path);
    if let Some(secs) = args.timeout_secs {
        client = client.with_timeout(Duration::from_secs(secs));
    }

    let result = match &args.command {
        Command::Serve { hypervisor, config } => {
            commands::serve(socket_path, *hypervisor, config.as_deref()).await
        }
        Command::Init { config } => commands::init(&client, config.as_deref()).await,
        Command::Create { name, slot } => commands::create(&client, name, *slot).await,
        Command::Delete { id } => commands::delete(&client, id).await,
        Command::List => commands::list(&client).await,
        Command::Shutdown => commands::shutdown(&client).await,
        Command::Version => {
            commands::version();
            Ok(())
        }
    };

    if let Err(e) = &result {
        error!(error = %format!("{:#}", e), "Command failed");
    }
    result
}
