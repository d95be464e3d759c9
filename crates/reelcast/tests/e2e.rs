//! E2E regression test suite for Reelcast
//!
//! Uses real loopback TCP sockets to exercise the full pipeline:
//!
//! - Recording → Bundle → broadcast worker → TCP → Client Dispatcher
//! - Heartbeat supervision and shutdown of live connections
//! - Client Dispatcher behaviour against a scripted server
//!
//! Run: `cargo test -p reelcast --test e2e`

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use reelcast::capture::FileCapture;
use reelcast::client::{extract_archive, ClientDispatcher, DispatchEvent, DispatcherState, ReceivedFile};
use reelcast::recording::{Bundle, BundleBuilder, RecordingController, StopReport};
use reelcast::server::{
    BroadcastWorker, Broadcaster, ConnectionRegistry, HeartbeatConfig, Server, ServerConfig,
};
use reelcast::transport::codec::{encode_file_unavailable, read_exact, read_file_header, read_tag};
use reelcast::transport::Tag;
use reelcast::{ReceiveError, ServerError, PONG};

const TIMEOUT: Duration = Duration::from_secs(10);

// ── Shared helpers ───────────────────────────────────────────────────

struct TestServer {
    addr: SocketAddr,
    registry: ConnectionRegistry,
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    async fn start(heartbeat: HeartbeatConfig) -> Self {
        let registry = ConnectionRegistry::new();
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            heartbeat,
            ..ServerConfig::default()
        };
        let server = Server::bind(config, registry.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accept = tokio::spawn(server.run(cancel.clone(), tracker.clone()));
        Self {
            addr,
            registry,
            cancel,
            tracker,
            accept,
        }
    }

    async fn wait_for_clients(&self, n: usize) {
        let registry = self.registry.clone();
        tokio::time::timeout(TIMEOUT, async move {
            while registry.count().await != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("registry never reached {n} clients"));
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        self.accept.await.unwrap().unwrap();
        self.tracker.close();
        tokio::time::timeout(TIMEOUT, self.tracker.wait()).await.unwrap();
    }
}

/// Heartbeat that probes once on connect and then stays out of the way
fn quiet_heartbeat() -> HeartbeatConfig {
    HeartbeatConfig {
        interval: Duration::from_secs(3600),
        reply_timeout: None,
    }
}

/// Run a dispatcher until it has received one file; returns the file and
/// the dispatcher state afterwards.
fn spawn_receiver(
    addr: SocketAddr,
    save_dir: &Path,
) -> JoinHandle<(ReceivedFile, DispatcherState)> {
    let save_dir = save_dir.to_path_buf();
    tokio::spawn(async move {
        let mut dispatcher = ClientDispatcher::connect(addr, save_dir).await.unwrap();
        loop {
            match dispatcher.next_event().await.unwrap() {
                DispatchEvent::FileReceived(file) => return (file, dispatcher.state()),
                DispatchEvent::Pong => continue,
                other => panic!("unexpected event {other:?}"),
            }
        }
    })
}

/// Deterministic, poorly compressible bytes
fn noise(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_4f6c_dd1du64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_delivers_bundle_to_two_clients() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(HeartbeatConfig::with_interval(Duration::from_millis(50))).await;

    let (handle, worker) = BroadcastWorker::spawn(
        Broadcaster::new(server.registry.clone()),
        server.cancel.clone(),
    );
    let mut reports = handle.subscribe();

    let client_a = spawn_receiver(server.addr, &dir.path().join("a"));
    let client_b = spawn_receiver(server.addr, &dir.path().join("b"));
    server.wait_for_clients(2).await;

    let mut controller = RecordingController::new(
        FileCapture::new(),
        dir.path().join("recordings"),
        BundleBuilder::new(dir.path().join("archives")),
    )
    .with_broadcast(handle.clone());

    let session_path = controller.start().unwrap().unwrap();
    let session_bytes = noise(12_345);
    controller.pipeline_mut().write_frame(&session_bytes).unwrap();
    let bundle = match controller.stop().unwrap() {
        StopReport::Finished { bundle, .. } => bundle.unwrap(),
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(bundle.members.len(), 1);
    assert_eq!(bundle.members[0].size_bytes, 12_345);

    let report = tokio::time::timeout(TIMEOUT, reports.recv()).await.unwrap().unwrap();
    assert_eq!(report.delivered(), 2);

    let session_name = session_path.file_name().unwrap();
    for client in [client_a, client_b] {
        let (file, state) = tokio::time::timeout(TIMEOUT, client).await.unwrap().unwrap();
        assert_eq!(state, DispatcherState::AwaitTag);
        assert_eq!(file.name, bundle.file_name());
        assert_eq!(file.size_bytes, bundle.size_bytes);
        assert_eq!(
            std::fs::read(&file.path).unwrap(),
            std::fs::read(&bundle.archive_path).unwrap()
        );

        let extracted_dir = file.path.parent().unwrap().join("extracted");
        let extracted = extract_archive(&file.path, &extracted_dir).unwrap();
        assert_eq!(extracted, vec![extracted_dir.join(session_name)]);
        assert_eq!(std::fs::read(&extracted[0]).unwrap(), session_bytes);
    }

    server.shutdown().await;
    worker.await.unwrap();
}

#[tokio::test]
async fn client_dropping_mid_transfer_does_not_affect_others() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(quiet_heartbeat()).await;

    // Larger than any loopback socket buffer, so the dropped peer is
    // noticed while the transfer is still running
    let payload = noise(16 * 1024 * 1024);
    let archive_path = dir.path().join("recordings_big.zip");
    std::fs::write(&archive_path, &payload).unwrap();
    let bundle = Bundle {
        archive_path: archive_path.clone(),
        size_bytes: payload.len() as u64,
        created_at: chrono::Local::now(),
        members: Vec::new(),
    };

    let client_1 = spawn_receiver(server.addr, &dir.path().join("c1"));
    server.wait_for_clients(1).await;

    let mut client_2 = TcpStream::connect(server.addr).await.unwrap();
    server.wait_for_clients(2).await;

    let client_3 = spawn_receiver(server.addr, &dir.path().join("c3"));
    server.wait_for_clients(3).await;

    // Client 2 reads the start of the transfer, then goes away
    let dropper = tokio::spawn(async move {
        loop {
            match read_tag(&mut client_2).await.unwrap() {
                Some(Tag::Ping) => continue,
                Some(Tag::File) => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        let header = read_file_header(&mut client_2).await.unwrap().unwrap();
        let mut some = vec![0u8; 8192];
        read_exact(&mut client_2, &mut some, "payload").await.unwrap();
        drop(client_2);
        header.payload_size
    });

    let broadcaster = Broadcaster::new(server.registry.clone());
    let report = tokio::time::timeout(TIMEOUT, broadcaster.broadcast(&bundle))
        .await
        .unwrap();

    assert_eq!(dropper.await.unwrap(), payload.len() as u64);
    assert_eq!(report.transfers.len(), 3);
    assert_eq!(report.delivered(), 2);
    assert_eq!(report.failed(), 1);

    for client in [client_1, client_3] {
        let (file, _) = tokio::time::timeout(TIMEOUT, client).await.unwrap().unwrap();
        assert_eq!(std::fs::read(&file.path).unwrap(), payload);
    }
    server.wait_for_clients(2).await;

    server.shutdown().await;
}

#[tokio::test]
async fn heartbeat_removes_silent_and_closed_clients() {
    let server = TestServer::start(HeartbeatConfig {
        interval: Duration::from_millis(20),
        reply_timeout: Some(Duration::from_millis(300)),
    })
    .await;

    let silent = TcpStream::connect(server.addr).await.unwrap();
    server.wait_for_clients(1).await;
    server.wait_for_clients(0).await;

    let closed = TcpStream::connect(server.addr).await.unwrap();
    server.wait_for_clients(1).await;
    drop(closed);
    server.wait_for_clients(0).await;

    let stats = server.registry.stats().await;
    assert_eq!(stats.total_added, 2);
    assert_eq!(stats.total_removed, 2);

    drop(silent);
    server.shutdown().await;
}

#[tokio::test]
async fn answering_client_survives_heartbeats() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(HeartbeatConfig::with_interval(Duration::from_millis(20))).await;

    let mut dispatcher = ClientDispatcher::connect(server.addr, dir.path()).await.unwrap();
    for _ in 0..5 {
        let event = tokio::time::timeout(TIMEOUT, dispatcher.next_event())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, DispatchEvent::Pong);
    }
    assert_eq!(server.registry.count().await, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_sends_quit_to_every_client() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(quiet_heartbeat()).await;

    let mut dispatchers = Vec::new();
    for _ in 0..2 {
        let mut dispatcher = ClientDispatcher::connect(server.addr, dir.path()).await.unwrap();
        // The first probe goes out as soon as the client is accepted
        let event = tokio::time::timeout(TIMEOUT, dispatcher.next_event())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, DispatchEvent::Pong);
        dispatchers.push(dispatcher);
    }
    server.wait_for_clients(2).await;
    let registry = server.registry.clone();
    server.shutdown().await;
    assert_eq!(registry.count().await, 0);

    for mut dispatcher in dispatchers {
        let event = tokio::time::timeout(TIMEOUT, dispatcher.next_event())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, DispatchEvent::Quit);
        assert_eq!(dispatcher.state(), DispatcherState::Closed);
        assert_eq!(dispatcher.next_event().await.unwrap(), DispatchEvent::Closed);
    }
}

#[tokio::test]
async fn empty_session_never_reaches_clients() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(quiet_heartbeat()).await;
    let (handle, worker) = BroadcastWorker::spawn(
        Broadcaster::new(server.registry.clone()),
        server.cancel.clone(),
    );

    let mut controller = RecordingController::new(
        FileCapture::new(),
        dir.path().join("recordings"),
        BundleBuilder::new(dir.path().join("archives")),
    )
    .with_broadcast(handle.clone());

    assert!(controller.start().unwrap().is_some());
    assert!(controller.start().unwrap().is_none());
    match controller.stop().unwrap() {
        StopReport::Finished { bundle, .. } => assert!(bundle.is_none()),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(controller.stop().unwrap(), StopReport::NotRecording);

    assert_eq!(handle.submitted(), 0);
    assert!(controller.builder().list_archives().unwrap().is_empty());

    server.shutdown().await;
    worker.await.unwrap();
}

#[tokio::test]
async fn session_open_at_shutdown_is_delivered_before_quit() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(quiet_heartbeat()).await;
    let (handle, worker) = BroadcastWorker::spawn(
        Broadcaster::new(server.registry.clone()),
        server.cancel.clone(),
    );

    let mut dispatcher = ClientDispatcher::connect(server.addr, dir.path().join("client"))
        .await
        .unwrap();
    let event = tokio::time::timeout(TIMEOUT, dispatcher.next_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, DispatchEvent::Pong);
    server.wait_for_clients(1).await;

    let mut controller = RecordingController::new(
        FileCapture::new(),
        dir.path().join("recordings"),
        BundleBuilder::new(dir.path().join("archives")),
    )
    .with_broadcast(handle.clone());
    controller.start().unwrap().unwrap();
    controller.pipeline_mut().write_frame(&noise(5_000)).unwrap();

    // Shutdown order: finalize, wait for the broadcast, then close the server
    let bundle = match controller.stop().unwrap() {
        StopReport::Finished { bundle, .. } => bundle.unwrap(),
        other => panic!("unexpected {other:?}"),
    };
    let receiving = tokio::spawn(async move {
        let mut events = Vec::new();
        loop {
            let event = dispatcher.next_event().await.unwrap();
            let done = matches!(event, DispatchEvent::Quit | DispatchEvent::Closed);
            events.push(event);
            if done {
                return events;
            }
        }
    });
    tokio::time::timeout(TIMEOUT, handle.settled()).await.unwrap();
    server.shutdown().await;
    worker.await.unwrap();

    let events = tokio::time::timeout(TIMEOUT, receiving).await.unwrap().unwrap();
    match events.as_slice() {
        [DispatchEvent::FileReceived(file), DispatchEvent::Quit] => {
            assert_eq!(file.name, bundle.file_name());
            assert_eq!(file.size_bytes, bundle.size_bytes);
        }
        other => panic!("unexpected events {other:?}"),
    }
}

// ── Client Dispatcher against a scripted server ──────────────────────

async fn scripted_server() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

#[tokio::test]
async fn unknown_tag_closes_connection() {
    let dir = tempfile::tempdir().unwrap();
    let (listener, addr) = scripted_server().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"XFILE  ").await.unwrap();
        // No body follows; the client must not wait for one
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        rest
    });

    let mut dispatcher = ClientDispatcher::connect(addr, dir.path()).await.unwrap();
    let err = tokio::time::timeout(TIMEOUT, dispatcher.next_event())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ReceiveError::Protocol(_)));
    assert_eq!(dispatcher.state(), DispatcherState::Closed);

    let rest = tokio::time::timeout(TIMEOUT, server).await.unwrap().unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn zero_size_report_returns_to_await_tag() {
    let dir = tempfile::tempdir().unwrap();
    let save_dir = dir.path().join("downloads");
    let (listener, addr) = scripted_server().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(&encode_file_unavailable()).await.unwrap();
        stream.write_all(Tag::Ping.as_bytes()).await.unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();
        reply
    });

    let mut dispatcher = ClientDispatcher::connect(addr, &save_dir).await.unwrap();
    assert_eq!(
        dispatcher.next_event().await.unwrap(),
        DispatchEvent::TransferAborted
    );
    assert_eq!(dispatcher.state(), DispatcherState::AwaitTag);
    assert_eq!(dispatcher.next_event().await.unwrap(), DispatchEvent::Pong);

    assert_eq!(&server.await.unwrap(), PONG);
    assert!(!save_dir.exists(), "nothing written");
}

#[tokio::test]
async fn resend_latest_archive_reaches_late_client() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(quiet_heartbeat()).await;
    let (handle, worker) = BroadcastWorker::spawn(
        Broadcaster::new(server.registry.clone()),
        server.cancel.clone(),
    );
    let mut reports = handle.subscribe();

    let mut controller = RecordingController::new(
        FileCapture::new(),
        dir.path().join("recordings"),
        BundleBuilder::new(dir.path().join("archives")),
    )
    .with_broadcast(handle.clone());

    // Recorded before anyone is connected
    controller.start().unwrap();
    controller.pipeline_mut().write_frame(b"late frame").unwrap();
    controller.stop().unwrap();
    let first = tokio::time::timeout(TIMEOUT, reports.recv()).await.unwrap().unwrap();
    assert!(first.transfers.is_empty());

    let client = spawn_receiver(server.addr, &dir.path().join("late"));
    server.wait_for_clients(1).await;

    let sent = controller.send_latest().unwrap().unwrap();
    let (file, _) = tokio::time::timeout(TIMEOUT, client).await.unwrap().unwrap();
    assert_eq!(file.name, sent.file_name());
    assert_eq!(sent.members.len(), 1);

    server.shutdown().await;
    worker.await.unwrap();
}
