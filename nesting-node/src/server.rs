//! Control socket server and daemon lifecycle.
//!
//! Each accepted connection runs on its own task and may carry several
//! requests, answered in order. On shutdown the listener closes first,
//! idle connections are dropped, in-flight requests run to completion and
//! only then is the backend shut down.

use anyhow::{Context as _, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use nesting_hypervisor::{Context, VirtualMachine};
use nesting_proto::request::Call;
use nesting_proto::response::Outcome;
use nesting_proto::{
    read_message, write_message, CreateResponse, DeleteResponse, ErrorCode, InitResponse,
    ListResponse, Request, Response, ShutdownResponse,
};

use crate::config::{build_hypervisor, ServeConfig};
use crate::service::NestingService;

/// Control socket server bound to a path.
pub struct Server {
    service: Arc<NestingService>,
    listener: UnixListener,
    socket_path: PathBuf,
}

impl Server {
    /// Bind the socket at `socket_path`.
    ///
    /// The parent directory is created if needed and a stale socket file
    /// left behind by a previous run is replaced.
    pub fn bind(service: Arc<NestingService>, socket_path: impl Into<PathBuf>) -> Result<Self> {
        let socket_path = socket_path.into();

        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create socket directory: {}", parent.display())
                })?;
            }
        }

        match std::fs::remove_file(&socket_path) {
            Ok(()) => debug!(path = %socket_path.display(), "Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to remove stale socket: {}", socket_path.display())
                })
            }
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind socket: {}", socket_path.display()))?;

        info!(path = %socket_path.display(), "Listening");
        Ok(Self {
            service,
            listener,
            socket_path,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serve connections until `shutdown` resolves, then drain them.
    ///
    /// The socket file is removed before returning.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Server {
            service,
            listener,
            socket_path,
        } = self;

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        debug!(active = connections.len() + 1, "Connection accepted");
                        connections.spawn(serve_connection(service.clone(), stream, stop_rx.clone()));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Connection task failed");
                    }
                }
            }
        }

        drop(listener);
        stop_tx.send_replace(true);

        if !connections.is_empty() {
            info!(active = connections.len(), "Waiting for in-flight requests");
        }
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Connection task failed");
            }
        }

        if let Err(e) = std::fs::remove_file(&socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %socket_path.display(), error = %e, "Failed to remove socket");
            }
        }
        Ok(())
    }
}

/// Answer requests on one connection until the peer hangs up or the server
/// stops.
async fn serve_connection(service: Arc<NestingService>, stream: UnixStream, mut stop: watch::Receiver<bool>) {
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let request = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break,
            read = read_message::<_, Request>(&mut reader) => read,
        };

        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Dropping connection after bad frame");
                break;
            }
        };

        let response = handle_request(&service, request).await;
        if let Err(e) = write_message(&mut writer, &response).await {
            warn!(error = %e, "Failed to write response");
            break;
        }
    }

    debug!("Connection closed");
}

/// Dispatch one request to the service and build its response.
#[instrument(skip_all, fields(request_id = %request.request_id))]
pub async fn handle_request(service: &NestingService, request: Request) -> Response {
    let request_id = request.request_id;
    let Some(call) = request.call else {
        warn!("Request without a call");
        return Response::error(request_id, ErrorCode::InvalidRequest, "request carries no call");
    };

    let mut ctx = Context::background();
    if request.timeout_ms > 0 {
        ctx = ctx.with_timeout(Duration::from_millis(request.timeout_ms));
    }

    let method = call.method();
    debug!(method, timeout_ms = request.timeout_ms, "Handling request");

    let result = match call {
        Call::Init(req) => service
            .init(&ctx, &req.config)
            .await
            .map(|()| Outcome::Init(InitResponse {})),
        Call::Shutdown(_) => service
            .shutdown(&ctx)
            .await
            .map(|()| Outcome::Shutdown(ShutdownResponse {})),
        Call::Create(req) => {
            if req.name.is_empty() {
                return Response::error(request_id, ErrorCode::InvalidRequest, "create requires an image name");
            }
            service
                .create(&ctx, &req.name, req.slot)
                .await
                .map(|created| {
                    Outcome::Create(CreateResponse {
                        vm: Some(to_proto(created.vm)),
                        stomped_vm_id: created.stomped_id,
                    })
                })
        }
        Call::Delete(req) => {
            if req.id.is_empty() {
                return Response::error(request_id, ErrorCode::InvalidRequest, "delete requires a vm id");
            }
            service
                .delete(&ctx, &req.id)
                .await
                .map(|()| Outcome::Delete(DeleteResponse {}))
        }
        Call::List(_) => service.list(&ctx).await.map(|vms| {
            Outcome::List(ListResponse {
                vms: vms.into_iter().map(to_proto).collect(),
            })
        }),
    };

    match result {
        Ok(outcome) => Response::ok(request_id, outcome),
        Err(e) => {
            let code = e.code();
            warn!(method, code = code.as_str(), error = %e, "Request failed");
            Response::error(request_id, code, e.to_string())
        }
    }
}

fn to_proto(vm: VirtualMachine) -> nesting_proto::VirtualMachine {
    nesting_proto::VirtualMachine {
        id: vm.id,
        name: vm.name,
        addr: vm.addr,
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Run the daemon until `shutdown` resolves.
///
/// The backend is shut down on the way out whether or not a client ever
/// initialized it.
pub async fn run<F>(config: ServeConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let hypervisor = build_hypervisor(config.hypervisor, &config.backend_config)?;
    let service = Arc::new(NestingService::new(hypervisor.clone()));

    let server = Server::bind(service, &config.socket_path)?;
    let served = server.serve(shutdown).await;

    info!(timeout_secs = config.shutdown_timeout.as_secs(), "Shutting down hypervisor");
    let ctx = Context::background().with_timeout(config.shutdown_timeout);
    if let Err(e) = hypervisor.shutdown(&ctx).await {
        warn!(error = %e, "Hypervisor shutdown failed");
    }

    served
}
