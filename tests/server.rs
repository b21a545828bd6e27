//! End-to-end tests against a real listener on an ephemeral loopback port.
//!
//! Each test starts its own server, talks to it with `FrameClient`, and
//! stops it through the same shutdown path the binary uses.

use frame_echo::protocol::REJECTION;
use frame_echo::{
    Config, DrainOutcome, FrameClient, FrameError, Listener, ServerError, SessionRegistry,
    ShutdownReport,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct TestServer {
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<ShutdownReport, ServerError>>,
}

impl TestServer {
    fn start(config: Config) -> Self {
        let listener = Listener::bind(config).expect("bind");
        let addr = listener.local_addr();
        let registry = Arc::clone(listener.registry());
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(listener.serve(async {
            let _ = stopped.await;
        }));

        Self {
            addr,
            registry,
            stop,
            task,
        }
    }

    async fn client(&self, max_frame_size: usize) -> FrameClient {
        FrameClient::connect(self.addr, max_frame_size)
            .await
            .expect("connect")
    }

    /// Signal shutdown without waiting for the drain to finish.
    fn begin_shutdown(self) -> JoinHandle<Result<ShutdownReport, ServerError>> {
        let _ = self.stop.send(());
        self.task
    }

    async fn shutdown(self) -> ShutdownReport {
        self.begin_shutdown().await.expect("join").expect("serve")
    }
}

fn config(max_sessions: usize, max_frame_size: usize) -> Config {
    Config {
        port: 0,
        max_sessions,
        max_frame_size,
        read_timeout: Duration::from_secs(5),
        drain_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

/// Poll until the registry holds exactly `n` sessions.
async fn wait_for_sessions(registry: &SessionRegistry, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while registry.len() != n {
        assert!(Instant::now() < deadline, "expected {n} sessions, have {}", registry.len());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_hello_scenario() {
    let server = TestServer::start(config(16, 1024));
    let mut client = server.client(1024).await;

    let response = client.request(b"hello").await.unwrap();
    assert_eq!(&response[..], b"Server received: hello");
    assert_eq!(server.registry.len(), 1);

    client.close().await.unwrap();
    assert!(server.registry.await_drain(Duration::from_secs(5)).await);

    let report = server.shutdown().await;
    assert_eq!(report.outcome, DrainOutcome::Graceful);
}

#[tokio::test]
async fn test_empty_and_max_size_payloads() {
    let server = TestServer::start(config(16, 4096));
    let mut client = server.client(4096).await;

    assert_eq!(&client.request(b"").await.unwrap()[..], b"Server received: ");

    let payload = vec![0xabu8; 4096];
    let response = client.request(&payload).await.unwrap();
    assert_eq!(&response[..17], b"Server received: ");
    assert_eq!(&response[17..], &payload[..]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_oversized_frame_closes_only_that_session() {
    let server = TestServer::start(config(16, 1024));
    let mut good = server.client(1024).await;
    let mut bad = server.client(1024).await;

    assert!(good.request(b"before").await.is_ok());

    bad.send_raw(&1025u32.to_be_bytes()).await.unwrap();
    match bad.recv().await {
        Ok(None) | Err(FrameError::Io(_)) => {}
        other => panic!("expected the connection to close, got {:?}", other),
    }
    wait_for_sessions(&server.registry, 1).await;

    let response = good.request(b"after").await.unwrap();
    assert_eq!(&response[..], b"Server received: after");

    server.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_clients_no_cross_talk() {
    const CLIENTS: usize = 50;
    const FRAMES: usize = 20;

    let server = TestServer::start(config(CLIENTS, 1024));
    let addr = server.addr;

    let mut tasks = Vec::with_capacity(CLIENTS);
    for c in 0..CLIENTS {
        tasks.push(tokio::spawn(async move {
            let mut client = FrameClient::connect(addr, 1024).await.unwrap();

            // Pipeline every request before reading any response.
            for m in 0..FRAMES {
                client.send(format!("client-{c}-msg-{m}").as_bytes()).await.unwrap();
            }
            for m in 0..FRAMES {
                let response = client.recv().await.unwrap().expect("response");
                let expected = format!("Server received: client-{c}-msg-{m}");
                assert_eq!(&response[..], expected.as_bytes());
            }
            client.close().await.unwrap();
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    assert!(server.registry.await_drain(Duration::from_secs(5)).await);
    assert_eq!(server.shutdown().await.outcome, DrainOutcome::Graceful);
}

#[tokio::test]
async fn test_capacity_rejects_new_connections() {
    let server = TestServer::start(config(2, 64));
    let mut first = server.client(64).await;
    let mut second = server.client(64).await;
    first.request(b"one").await.unwrap();
    second.request(b"two").await.unwrap();
    wait_for_sessions(&server.registry, 2).await;

    let mut third = server.client(64).await;
    let rejection = third.recv().await.unwrap().expect("rejection frame");
    assert_eq!(&rejection[..], REJECTION);
    assert!(matches!(third.recv().await, Ok(None) | Err(FrameError::Io(_))));

    assert_eq!(server.registry.len(), 2);
    assert_eq!(&first.request(b"still").await.unwrap()[..], b"Server received: still");
    assert_eq!(&second.request(b"here").await.unwrap()[..], b"Server received: here");

    // A freed slot admits the next connection.
    first.close().await.unwrap();
    wait_for_sessions(&server.registry, 1).await;
    let mut fourth = server.client(64).await;
    assert_eq!(&fourth.request(b"in").await.unwrap()[..], b"Server received: in");

    server.shutdown().await;
}

#[tokio::test]
async fn test_graceful_shutdown_closes_idle_sessions() {
    const SESSIONS: usize = 5;

    let server = TestServer::start(config(16, 1024));
    let mut clients = Vec::new();
    for i in 0..SESSIONS {
        let mut client = server.client(1024).await;
        client.request(format!("idle-{i}").as_bytes()).await.unwrap();
        clients.push(client);
    }
    wait_for_sessions(&server.registry, SESSIONS).await;

    let started = Instant::now();
    let registry = Arc::clone(&server.registry);
    let report = server.shutdown().await;

    assert_eq!(report.outcome, DrainOutcome::Graceful);
    assert_eq!(report.forced, 0);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(registry.is_empty());

    for client in &mut clients {
        assert!(matches!(client.recv().await, Ok(None) | Err(FrameError::Io(_))));
    }
}

#[tokio::test]
async fn test_shutdown_answers_request_in_flight() {
    let server = TestServer::start(config(16, 1024));
    let mut client = server.client(1024).await;

    // Header and the first two payload bytes of "hello".
    client.send_raw(b"\x00\x00\x00\x05he").await.unwrap();
    wait_for_sessions(&server.registry, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let registry = Arc::clone(&server.registry);
    let drain = server.begin_shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(registry.len(), 1);

    client.send_raw(b"llo").await.unwrap();
    let response = client.recv().await.unwrap().unwrap();
    assert_eq!(&response[..], b"Server received: hello");
    assert!(matches!(client.recv().await, Ok(None) | Err(FrameError::Io(_))));

    let report = drain.await.expect("join").expect("serve");
    assert_eq!(report.outcome, DrainOutcome::Graceful);
    assert_eq!(report.forced, 0);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_forced_shutdown_when_session_is_stuck_writing() {
    let mut config = config(16, 1024 * 1024);
    config.drain_timeout = Duration::from_millis(200);
    config.read_timeout = Duration::from_secs(30);
    let server = TestServer::start(config);

    // Never read responses: the server's writes back up until the session
    // blocks mid-write, where cancellation cannot reach it.
    let mut stuck = server.client(1024 * 1024).await;
    let flood = tokio::spawn(async move {
        let payload = vec![7u8; 1024 * 1024];
        for _ in 0..64 {
            if stuck.send(&payload).await.is_err() {
                break;
            }
        }
        stuck
    });
    wait_for_sessions(&server.registry, 1).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let started = Instant::now();
    let registry = Arc::clone(&server.registry);
    let report = server.shutdown().await;

    assert_eq!(report.outcome, DrainOutcome::Forced);
    assert_eq!(report.forced, 1);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(registry.is_empty());

    flood.abort();
}

#[tokio::test]
async fn test_no_connections_after_shutdown() {
    let server = TestServer::start(config(16, 1024));
    let addr = server.addr;
    server.shutdown().await;

    assert!(FrameClient::connect(addr, 1024).await.is_err());
}
