//! Integration tests for the control socket.
//!
//! These tests run the server on a temporary socket with the mock backend
//! and talk to it through the real client.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use nesting_hypervisor::{FrameworkBackend, FrameworkConfig, MockBackend, SimulatedEngine};
use nesting_node::{Client, ClientError, NestingService, Server};
use nesting_proto::response::Outcome;
use nesting_proto::{read_message, write_message, ErrorCode, Request, Response};

struct Harness {
    _dir: tempfile::TempDir,
    socket: PathBuf,
    stop: Option<oneshot::Sender<()>>,
    server: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = FrameworkConfig {
            image_directory: dir.path().join("images"),
            working_directory: dir.path().join("data"),
            max_machines: 2,
            graceful_stop_timeout_secs: 1,
        };
        let service = Arc::new(NestingService::new(Arc::new(MockBackend::simulated_with_config(config))));

        // Nested path: the server creates missing parents.
        let socket = dir.path().join("run").join("nesting.sock");
        let server = Server::bind(service, &socket).unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(server.serve(async {
            let _ = stopped.await;
        }));

        Self {
            _dir: dir,
            socket,
            stop: Some(stop),
            server,
        }
    }

    fn client(&self) -> Client {
        Client::new(&self.socket)
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        (&mut self.server).await.unwrap().unwrap();
        assert!(!self.socket.exists(), "socket should be removed on shutdown");
    }
}

fn status_code(err: &ClientError) -> Option<ErrorCode> {
    err.code()
}

#[tokio::test]
async fn test_full_lifecycle_over_socket() {
    let harness = Harness::start();
    let client = harness.client();

    let err = client.list().await.unwrap_err();
    assert_eq!(status_code(&err), Some(ErrorCode::NotInitialized));

    client.init(Vec::new()).await.unwrap();
    let err = client.init(Vec::new()).await.unwrap_err();
    assert_eq!(status_code(&err), Some(ErrorCode::AlreadyInitialized));

    let (first, stomped) = client.create("ubuntu", Some(0)).await.unwrap();
    assert!(first.id.starts_with("nesting-"));
    assert_eq!(first.name, "ubuntu");
    assert!(!first.addr.is_empty());
    assert_eq!(stomped, None);

    let (second, stomped) = client.create("ubuntu", Some(0)).await.unwrap();
    assert_eq!(stomped.as_deref(), Some(first.id.as_str()));

    let listed = client.list().await.unwrap();
    assert_eq!(listed, vec![second.clone()]);

    client.delete(&second.id).await.unwrap();
    let err = client.delete(&second.id).await.unwrap_err();
    assert_eq!(status_code(&err), Some(ErrorCode::NotFound));
    assert!(client.list().await.unwrap().is_empty());

    client.shutdown().await.unwrap();
    let err = client.shutdown().await.unwrap_err();
    assert_eq!(status_code(&err), Some(ErrorCode::NotInitialized));

    harness.stop().await;
}

#[tokio::test]
async fn test_pool_exhaustion_is_reported() {
    let harness = Harness::start();
    let client = harness.client();
    client.init(Vec::new()).await.unwrap();

    client.create("img", None).await.unwrap();
    client.create("img", None).await.unwrap();
    let err = client.create("img", None).await.unwrap_err();
    assert_eq!(status_code(&err), Some(ErrorCode::ResourceExhausted));

    harness.stop().await;
}

#[tokio::test]
async fn test_invalid_requests_get_an_error_reply() {
    let harness = Harness::start();
    let mut stream = UnixStream::connect(&harness.socket).await.unwrap();

    // Several requests on one connection, answered in order.
    let empty = Request {
        request_id: "r1".to_string(),
        timeout_ms: 0,
        call: None,
    };
    write_message(&mut stream, &empty).await.unwrap();
    let reply: Response = read_message(&mut stream).await.unwrap().unwrap();
    assert_eq!(reply.request_id, "r1");
    match reply.outcome {
        Some(Outcome::Error(status)) => assert_eq!(status.code, ErrorCode::InvalidRequest as i32),
        other => panic!("unexpected outcome {:?}", other),
    }

    let nameless = Request::new(
        "r2",
        nesting_proto::request::Call::Create(nesting_proto::CreateRequest {
            name: String::new(),
            slot: Some(1),
        }),
    );
    write_message(&mut stream, &nameless).await.unwrap();
    let reply: Response = read_message(&mut stream).await.unwrap().unwrap();
    assert_eq!(reply.request_id, "r2");
    assert!(matches!(
        reply.outcome,
        Some(Outcome::Error(ref status)) if status.code == ErrorCode::InvalidRequest as i32
    ));

    drop(stream);
    harness.stop().await;
}

#[tokio::test]
async fn test_invalid_config_is_a_driver_error() {
    let harness = Harness::start();
    let client = harness.client().with_timeout(Duration::from_secs(30));

    let err = client.init(b"max_machines: 0\n".to_vec()).await.unwrap_err();
    assert_eq!(status_code(&err), Some(ErrorCode::Driver));

    // Still uninitialized, so a valid init works.
    client.init(Vec::new()).await.unwrap();
    harness.stop().await;
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_requests() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FrameworkBackend::with_config(
        SimulatedEngine::new().with_delay(Duration::from_millis(500)),
        FrameworkConfig {
            image_directory: dir.path().join("images"),
            working_directory: dir.path().join("data"),
            max_machines: 1,
            graceful_stop_timeout_secs: 1,
        },
    ));
    let service = Arc::new(NestingService::new(backend.clone()));
    let socket = dir.path().join("nesting.sock");
    let server = Server::bind(service, &socket).unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(server.serve(async {
        let _ = stopped.await;
    }));

    let client = Client::new(&socket);
    client.init(Vec::new()).await.unwrap();

    let in_flight = tokio::spawn({
        let client = Client::new(&socket);
        async move { client.create("ubuntu", Some(0)).await }
    });
    for _ in 0..50 {
        if backend.pool().available().unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(backend.pool().available().unwrap(), 0, "create never started");

    stop.send(()).unwrap();

    // New connections are refused while the create is still booting.
    let mut refused = false;
    for _ in 0..50 {
        if UnixStream::connect(&socket).await.is_err() {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(refused, "server kept accepting after shutdown");
    assert!(!in_flight.is_finished());

    let (vm, stomped) = in_flight.await.unwrap().unwrap();
    assert_eq!(vm.name, "ubuntu");
    assert_eq!(stomped, None);

    server.await.unwrap().unwrap();
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_connect_to_missing_socket() {
    let dir = tempfile::tempdir().unwrap();
    let client = Client::new(dir.path().join("absent.sock"));
    assert!(matches!(client.list().await, Err(ClientError::Connect { .. })));
}

#[tokio::test]
async fn test_stale_socket_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("nesting.sock");
    std::fs::write(&socket, b"stale").unwrap();

    let service = Arc::new(NestingService::new(Arc::new(MockBackend::simulated())));
    let server = Server::bind(service, &socket).unwrap();
    assert_eq!(server.socket_path(), socket.as_path());

    let handle = tokio::spawn(server.serve(async {}));
    handle.await.unwrap().unwrap();
    assert!(!socket.exists());
}
