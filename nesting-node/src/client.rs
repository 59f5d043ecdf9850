//! Client for the control socket.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::UnixStream;
use tracing::debug;

use nesting_proto::request::Call;
use nesting_proto::response::Outcome;
use nesting_proto::{
    read_message, write_message, CreateRequest, CreateResponse, DeleteRequest, ErrorCode, InitRequest,
    ListRequest, Request, Response, ShutdownRequest, VirtualMachine,
};

use crate::error::ClientError;
use crate::socket::socket_path;

/// Result type alias for client calls.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Talks to a running daemon. Every call uses a fresh connection.
#[derive(Debug)]
pub struct Client {
    socket_path: PathBuf,
    timeout: Option<Duration>,
    next_id: AtomicU64,
}

impl Client {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: None,
            next_id: AtomicU64::new(1),
        }
    }

    /// Client for the default socket location.
    pub fn from_env() -> Self {
        Self::new(socket_path())
    }

    /// Ask the server to abandon calls that take longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn init(&self, config: Vec<u8>) -> Result<()> {
        match self.call(Call::Init(InitRequest { config })).await? {
            Outcome::Init(_) => Ok(()),
            _ => Err(ClientError::UnexpectedReply("init")),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        match self.call(Call::Shutdown(ShutdownRequest {})).await? {
            Outcome::Shutdown(_) => Ok(()),
            _ => Err(ClientError::UnexpectedReply("shutdown")),
        }
    }

    /// Create a VM, returning it and the id of the VM it replaced in `slot`.
    pub async fn create(&self, name: &str, slot: Option<i32>) -> Result<(VirtualMachine, Option<String>)> {
        let call = Call::Create(CreateRequest {
            name: name.to_string(),
            slot,
        });
        match self.call(call).await? {
            Outcome::Create(CreateResponse { vm: Some(vm), stomped_vm_id }) => Ok((vm, stomped_vm_id)),
            _ => Err(ClientError::UnexpectedReply("create")),
        }
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let call = Call::Delete(DeleteRequest { id: id.to_string() });
        match self.call(call).await? {
            Outcome::Delete(_) => Ok(()),
            _ => Err(ClientError::UnexpectedReply("delete")),
        }
    }

    pub async fn list(&self) -> Result<Vec<VirtualMachine>> {
        match self.call(Call::List(ListRequest {})).await? {
            Outcome::List(list) => Ok(list.vms),
            _ => Err(ClientError::UnexpectedReply("list")),
        }
    }

    async fn call(&self, call: Call) -> Result<Outcome> {
        let method = call.method();
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let mut request = Request::new(request_id, call);
        if let Some(timeout) = self.timeout {
            request = request.with_timeout_ms(timeout.as_millis() as u64);
        }

        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| ClientError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;

        debug!(method, request_id = %request.request_id, "Sending request");
        write_message(&mut stream, &request).await?;
        let response: Response = read_message(&mut stream).await?.ok_or(ClientError::Closed)?;

        match response.outcome {
            Some(Outcome::Error(status)) => Err(ClientError::Status {
                code: ErrorCode::try_from(status.code).unwrap_or(ErrorCode::Unspecified),
                message: status.message,
            }),
            Some(outcome) => Ok(outcome),
            None => Err(ClientError::UnexpectedReply(method)),
        }
    }
}
