//! Client/Server Integration Tests
//!
//! Servers run their monitor loop on a thread of their own; the client drives
//! requests from the test thread.
//!
//! # Running with tracing
//!
//! Use TEST_LOG environment variable to control tracing verbosity (like -v, -vv, -vvv):
//!
//! ```bash
//! # Info level (equivalent to -v)
//! TEST_LOG=1 cargo test --test client_server -- --nocapture
//!
//! # Debug level (equivalent to -vv)
//! TEST_LOG=2 cargo test --test client_server -- --nocapture
//!
//! # Trace level (equivalent to -vvv)
//! TEST_LOG=3 cargo test --test client_server -- --nocapture
//! ```


use pmconnect::prelude::*;
use pmconnect::{deserialize_frame, serialize_frame, ConnectionEvent, Frame, Reply, Request, ThreadGroupController};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::Once;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use test_objects::*;

static INIT: Once = Once::new();

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing based on TEST_LOG environment variable
///
/// Verbosity levels (like -v, -vv, -vvv):
/// - TEST_LOG=1: Info level
/// - TEST_LOG=2: Debug level
/// - TEST_LOG=3: Trace level
fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace", // 3 or more
                };

                let filter = format!("pmconnect={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Helper Functions
// ============================================================================

const SERVER_DEADLINE: Duration = Duration::from_secs(20);

/// Runs `manager`'s monitor loop until its client drops or the deadline
/// passes. Returns how many connections were dropped.
fn serve_until_dropped(manager: &mut ConnectionManager, deadline: Duration) -> usize {
    let start = Instant::now();
    let mut dropped = 0;
    while start.elapsed() < deadline {
        match manager
            .monitor_connections(Some(Duration::from_millis(50)))
            .expect("[Server] Monitor failed")
        {
            MonitorStatus::ConnectionDropped => {
                dropped += 1;
                break;
            }
            MonitorStatus::ConnectionCreated => println!("[Server] Client connected"),
            MonitorStatus::Processed | MonitorStatus::NoActivity => {}
        }
    }
    manager.finalize();
    dropped
}

/// Starts a listening server of `role` with `processes` ranks. Returns its
/// address and the root's thread.
fn spawn_server(
    role: ProcessRole,
    settings: ConnectionSettings,
    processes: usize,
    deadline: Duration,
) -> (SocketAddr, JoinHandle<usize>) {
    let (addr_tx, addr_rx) = mpsc::channel();
    let mut controllers = ThreadGroupController::group(processes);
    let root = controllers.remove(0);

    for controller in controllers {
        let settings = settings.clone();
        thread::spawn(move || {
            let mut manager = new_manager(settings);
            manager
                .initialize(role, Box::new(controller))
                .expect("[Satellite] Failed to initialize");
        });
    }

    let server = thread::spawn(move || {
        let mut manager = new_manager(settings);
        manager
            .initialize(role, Box::new(root))
            .expect("[Server] Failed to initialize");
        let listener = manager
            .accept_connections_on_port(0, ServerSocketType::RenderAndDataServer)
            .expect("[Server] Failed to listen");
        let addr = manager
            .listener_address(listener)
            .expect("[Server] Listener has no address");
        addr_tx.send(addr).expect("[Server] Test thread gone");
        serve_until_dropped(&mut manager, deadline)
    });

    let addr = addr_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Server did not start");
    (addr, server)
}

fn client(settings: ConnectionSettings) -> ConnectionManager {
    let mut manager = new_manager(settings);
    manager
        .initialize(ProcessRole::Client, Box::new(DummyController))
        .expect("[Client] Failed to initialize");
    manager
}

fn send(manager: &mut ConnectionManager, id: ConnectionId, flags: ServerFlags, mut stream: CommandStream) {
    manager
        .send_stream(id, flags, &mut stream, true)
        .expect("[Client] Failed to send stream");
}

/// Reads from a plain socket until one whole frame is there.
fn read_frame(stream: &mut TcpStream) -> Frame {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some((frame, _)) = deserialize_frame(&buf).expect("Peer sent a broken frame") {
            return frame;
        }
        let len = stream.read(&mut chunk).expect("Failed to read from peer");
        assert!(len > 0, "Peer closed before sending a frame");
        buf.extend_from_slice(&chunk[..len]);
    }
}

// ============================================================================
// Requests
// ============================================================================

#[test]
fn client_server_requests() {
    init_tracing();
    let (addr, server) = spawn_server(
        ProcessRole::CombinedServer,
        test_settings(),
        1,
        SERVER_DEADLINE,
    );

    let mut manager = client(test_settings());
    let id = manager
        .open_connection("127.0.0.1", addr.port())
        .expect("[Client] Failed to connect");
    assert_eq!(manager.take_events(), vec![ConnectionEvent::Created { id }]);
    assert!(manager.is_server_connection(id));
    let connection = manager
        .get_connection_from_id(id)
        .and_then(|c| c.as_server_connection())
        .expect("Not a server connection");
    assert_eq!(connection.number_of_data_partitions(), 1);
    assert!(!connection.has_render_server_channel());

    // ------------------------------------------------------------------------
    // Streams and results
    // ------------------------------------------------------------------------
    send(&mut manager, id, ServerFlags::DATA_SERVER, create_counter(5));
    let result = manager
        .get_last_result(id, ServerFlags::DATA_SERVER_ROOT)
        .expect("[Client] Failed to get last result");
    assert_eq!(result.argument(0, 0), Some(&Value::Int(5)));

    // ALL_SERVERS reaches the only server
    send(
        &mut manager,
        ConnectionId::ALL_SERVERS,
        ServerFlags::DATA_SERVER,
        invoke("Add", vec![Value::Int(2)]),
    );

    // ------------------------------------------------------------------------
    // Gather
    // ------------------------------------------------------------------------
    let mut info = CounterSum::default();
    manager
        .gather_information(id, ServerFlags::DATA_SERVER, &mut info, COUNTER)
        .expect("[Client] Failed to gather");
    assert_eq!(
        info,
        CounterSum {
            total: 7,
            contributors: 1
        }
    );

    // The server reports the failure; the connection stays usable
    let mut missing = CounterSum::default();
    let result = manager.gather_information(
        ConnectionId::ROOT_SERVER,
        ServerFlags::DATA_SERVER,
        &mut missing,
        ObjectHandle(999),
    );
    assert!(matches!(result, Err(Error::Remote(_))), "{result:?}");
    let result = manager
        .get_last_result(id, ServerFlags::DATA_SERVER_ROOT)
        .expect("[Client] Connection should survive a remote error");
    assert_eq!(result.argument(0, 0), Some(&Value::Int(7)));

    // ------------------------------------------------------------------------
    // Modules
    // ------------------------------------------------------------------------
    manager
        .load_module(id, "echo", "/opt/modules")
        .expect("[Client] Failed to load module");
    assert!(matches!(
        manager.load_module(id, "missing", ""),
        Err(Error::Remote(_))
    ));

    let mut stream = CommandStream::new();
    stream.new_object("Echo", ECHO);
    stream.invoke(ECHO, "Ping").arg(42).end();
    send(&mut manager, id, ServerFlags::DATA_SERVER, stream);
    let result = manager
        .get_last_result(id, ServerFlags::DATA_SERVER_ROOT)
        .expect("[Client] Failed to get last result");
    assert_eq!(result.argument(0, 0), Some(&Value::Int(42)));

    // ------------------------------------------------------------------------
    // Undo
    // ------------------------------------------------------------------------
    manager.push_undo(id, "first", "<first/>").expect("[Client] Failed to push undo");
    manager.push_undo(id, "second", "<second/>").expect("[Client] Failed to push undo");
    assert_eq!(
        manager.pull_undo(id, false).expect("[Client] Undo failed"),
        Some("<second/>".to_string())
    );
    assert_eq!(
        manager.pull_undo(id, false).expect("[Client] Undo failed"),
        Some("<first/>".to_string())
    );
    assert_eq!(manager.pull_undo(id, false).expect("[Client] Undo failed"), None);
    assert_eq!(
        manager.pull_undo(id, true).expect("[Client] Redo failed"),
        Some("<first/>".to_string())
    );

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------
    manager.close_connection(id).expect("[Client] Failed to close");
    assert_eq!(manager.take_events(), vec![ConnectionEvent::Closed { id }]);
    assert_eq!(server.join().expect("Server panicked"), 1);
}

#[test]
fn server_group_fans_out_client_streams() {
    init_tracing();
    let (addr, server) = spawn_server(ProcessRole::DataServer, test_settings(), 3, SERVER_DEADLINE);

    let mut manager = client(test_settings());
    let id = manager
        .open_connection("127.0.0.1", addr.port())
        .expect("[Client] Failed to connect");
    let partitions = manager
        .get_connection_from_id(id)
        .and_then(|c| c.as_server_connection())
        .map(|c| c.number_of_data_partitions());
    assert_eq!(partitions, Some(3));

    send(&mut manager, id, ServerFlags::DATA_SERVER, create_counter(0));
    send(&mut manager, id, ServerFlags::DATA_SERVER, invoke("AddRank", vec![]));
    send(
        &mut manager,
        id,
        ServerFlags::DATA_SERVER_ROOT,
        invoke("Add", vec![Value::Int(100)]),
    );

    let mut info = CounterSum::default();
    manager
        .gather_information(id, ServerFlags::DATA_SERVER, &mut info, COUNTER)
        .expect("[Client] Failed to gather");
    assert_eq!(
        info,
        CounterSum {
            total: 1 + 2 + 3 + 100,
            contributors: 3
        }
    );

    let mut partitions = pmconnect::PartitionInformation::default();
    manager
        .gather_information(
            id,
            ServerFlags::DATA_SERVER,
            &mut partitions,
            ObjectHandle::PROCESS_MODULE,
        )
        .expect("[Client] Failed to gather partitions");
    assert_eq!(partitions.partitions.into_iter().collect::<Vec<_>>(), vec![0, 1, 2]);

    manager.finalize();
    assert_eq!(server.join().expect("Server panicked"), 1);
}

// ============================================================================
// Progress
// ============================================================================

#[test]
fn progress_travels_to_client() {
    init_tracing();
    let (addr, server) = spawn_server(ProcessRole::CombinedServer, test_settings(), 2, SERVER_DEADLINE);

    let mut manager = client(test_settings());
    let id = manager
        .open_connection("127.0.0.1", addr.port())
        .expect("[Client] Failed to connect");
    send(&mut manager, id, ServerFlags::DATA_SERVER, create_counter(0));

    manager
        .progress_handler_mut(id)
        .expect("No handler")
        .register_progress_event(COUNTER, 11);
    manager.prepare_progress(id).expect("[Client] Failed to prepare progress");

    send(&mut manager, id, ServerFlags::DATA_SERVER, invoke("Work", vec![Value::Int(2)]));

    // A request that ends in a collective forces every report out first
    let mut info = CounterSum::default();
    manager
        .gather_information(id, ServerFlags::DATA_SERVER, &mut info, COUNTER)
        .expect("[Client] Failed to gather");

    let events = manager
        .progress_handler_mut(id)
        .expect("No handler")
        .take_events();
    println!("[Client] {} progress events", events.len());
    assert!(events.iter().all(|e| e.id == 11 && e.source == COUNTER));
    for partition in 0..2 {
        let reported: Vec<u8> = events
            .iter()
            .filter(|e| e.partition == partition)
            .map(|e| e.progress)
            .collect();
        assert_eq!(reported, vec![0, 50, 100], "partition {partition}");
    }

    manager
        .cleanup_pending_progress(id)
        .expect("[Client] Failed to clean up progress");
    send(&mut manager, id, ServerFlags::DATA_SERVER, invoke("Work", vec![Value::Int(2)]));
    manager
        .get_last_result(id, ServerFlags::DATA_SERVER_ROOT)
        .expect("[Client] Failed to get last result");
    assert!(manager
        .progress_handler_mut(id)
        .expect("No handler")
        .take_events()
        .is_empty());

    manager.finalize();
    assert_eq!(server.join().expect("Server panicked"), 1);
}

// ============================================================================
// Handshake
// ============================================================================

#[test]
fn handshake_rejects_wrong_connect_id() {
    init_tracing();
    let (addr, server) = spawn_server(
        ProcessRole::CombinedServer,
        test_settings().with_connect_id(7),
        1,
        Duration::from_secs(2),
    );

    let mut manager = client(test_settings().with_connect_id(8));
    let result = manager.open_connection("127.0.0.1", addr.port());
    assert!(matches!(result, Err(Error::HandshakeRejected(_))), "{result:?}");
    assert_eq!(manager.number_of_connections(), 1);
    assert!(manager.take_events().is_empty());

    // The server never got a connection to drop
    assert_eq!(server.join().expect("Server panicked"), 0);
}

#[test]
fn handshake_rejects_server_to_server() {
    init_tracing();
    let (addr, server) = spawn_server(ProcessRole::DataServer, test_settings(), 1, Duration::from_secs(2));

    let mut manager = new_manager(test_settings());
    manager
        .initialize(ProcessRole::RenderServer, Box::new(DummyController))
        .expect("Failed to initialize");
    let result = manager.open_connection("127.0.0.1", addr.port());
    assert!(matches!(result, Err(Error::HandshakeRejected(_))), "{result:?}");
    assert_eq!(server.join().expect("Server panicked"), 0);
}

#[test]
fn handshake_rejects_other_protocol_version() {
    init_tracing();
    let (addr, server) = spawn_server(
        ProcessRole::CombinedServer,
        test_settings(),
        1,
        Duration::from_secs(2),
    );

    let mut hello = serialize_frame(&Frame::Request(Request::Handshake {
        connect_id: 0,
        role: ProcessRole::Client,
    }))
    .expect("Failed to serialize handshake");
    // Major version
    hello[4] += 1;

    let mut stream = TcpStream::connect(("127.0.0.1", addr.port())).expect("Failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("Failed to set timeout");
    stream.write_all(&hello).expect("Failed to send handshake");

    match read_frame(&mut stream) {
        Frame::Exception(reason) => {
            println!("[Client] Rejected: {reason}");
            assert!(reason.contains("version"), "{reason}");
        }
        other => panic!("Expected a rejection, got {other:?}"),
    }
    assert_eq!(server.join().expect("Server panicked"), 0);
}

#[test]
fn open_fails_when_peer_answers_in_other_version() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
    let port = listener.local_addr().expect("No address").port();

    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("[Peer] Failed to accept");
        assert!(matches!(
            read_frame(&mut stream),
            Frame::Request(Request::Handshake { .. })
        ));
        let mut answer = serialize_frame(&Frame::Reply(Reply::Handshake {
            role: ProcessRole::DataServer,
            number_of_partitions: 1,
        }))
        .expect("[Peer] Failed to serialize");
        answer[4] += 1;
        stream.write_all(&answer).expect("[Peer] Failed to answer");
        // Until the client hangs up
        let _ = stream.read_to_end(&mut Vec::new());
    });

    let mut manager = client(test_settings());
    let result = manager.open_connection("127.0.0.1", port);
    assert!(matches!(result, Err(Error::HandshakeRejected(_))), "{result:?}");
    assert_eq!(manager.number_of_connections(), 1);
    assert!(manager.take_events().is_empty());
    drop(manager);
    peer.join().expect("Peer panicked");
}

// ============================================================================
// Split Data and Render Servers
// ============================================================================

/// A server process that connects back to a listening client.
fn spawn_reverse_server(role: ProcessRole, port: u16) -> JoinHandle<usize> {
    thread::spawn(move || {
        let mut manager = new_manager(test_settings());
        manager
            .initialize(role, Box::new(DummyController))
            .expect("[Server] Failed to initialize");
        manager
            .open_connection("127.0.0.1", port)
            .expect("[Server] Failed to connect to client");
        serve_until_dropped(&mut manager, SERVER_DEADLINE)
    })
}

fn monitor_until<F>(manager: &mut ConnectionManager, mut done: F) -> MonitorStatus
where
    F: FnMut(&ConnectionManager, MonitorStatus) -> bool,
{
    let start = Instant::now();
    while start.elapsed() < SERVER_DEADLINE {
        let status = manager
            .monitor_connections(Some(Duration::from_millis(50)))
            .expect("[Client] Monitor failed");
        if done(manager, status) {
            return status;
        }
    }
    panic!("[Client] Condition not reached in time");
}

#[test]
fn client_pairs_data_and_render_servers() {
    init_tracing();
    let mut manager = client(test_settings());
    let data_listener = manager
        .accept_connections_on_port(0, ServerSocketType::DataServer)
        .expect("[Client] Failed to listen for data servers");
    let render_listener = manager
        .accept_connections_on_port(0, ServerSocketType::RenderServer)
        .expect("[Client] Failed to listen for render servers");
    let data_port = manager.listener_address(data_listener).expect("No address").port();
    let render_port = manager.listener_address(render_listener).expect("No address").port();

    // The data half waits for its partner
    let data_server = spawn_reverse_server(ProcessRole::DataServer, data_port);
    monitor_until(&mut manager, |m, _| m.pending_half_connections() == (1, 0));
    assert_eq!(manager.number_of_connections(), 1);

    let render_server = spawn_reverse_server(ProcessRole::RenderServer, render_port);
    monitor_until(&mut manager, |_, status| status == MonitorStatus::ConnectionCreated);
    assert_eq!(manager.pending_half_connections(), (0, 0));

    let id = match manager.take_events().as_slice() {
        [ConnectionEvent::Created { id }] => *id,
        other => panic!("Unexpected events {other:?}"),
    };
    assert!(manager
        .get_connection_from_id(id)
        .and_then(|c| c.as_server_connection())
        .is_some_and(|c| c.has_render_server_channel()));
    manager.stop_accepting_all_connections();

    // Data and render flags reach different processes
    send(&mut manager, id, ServerFlags::DATA_SERVER, create_counter(1));
    send(&mut manager, id, ServerFlags::RENDER_SERVER, create_counter(2));

    let mut data = CounterSum::default();
    manager
        .gather_information(id, ServerFlags::DATA_SERVER, &mut data, COUNTER)
        .expect("[Client] Failed to gather from data server");
    let mut render = CounterSum::default();
    manager
        .gather_information(id, ServerFlags::RENDER_SERVER, &mut render, COUNTER)
        .expect("[Client] Failed to gather from render server");
    assert_eq!(data.total, 1);
    assert_eq!(render.total, 2);

    // Both flags: one stream per side
    send(
        &mut manager,
        id,
        ServerFlags::DATA_SERVER | ServerFlags::RENDER_SERVER,
        invoke("Add", vec![Value::Int(10)]),
    );
    let mut data = CounterSum::default();
    manager
        .gather_information(id, ServerFlags::DATA_SERVER_ROOT, &mut data, COUNTER)
        .expect("[Client] Failed to gather from data server");
    assert_eq!(data.total, 11);

    manager.close_connection(id).expect("[Client] Failed to close");
    assert_eq!(data_server.join().expect("Data server panicked"), 1);
    assert_eq!(render_server.join().expect("Render server panicked"), 1);
}

#[test]
fn client_skips_half_connection_whose_server_left() {
    init_tracing();
    let mut manager = client(test_settings());
    let data_listener = manager
        .accept_connections_on_port(0, ServerSocketType::DataServer)
        .expect("[Client] Failed to listen for data servers");
    let render_listener = manager
        .accept_connections_on_port(0, ServerSocketType::RenderServer)
        .expect("[Client] Failed to listen for render servers");
    let data_port = manager.listener_address(data_listener).expect("No address").port();
    let render_port = manager.listener_address(render_listener).expect("No address").port();

    // A data server checks in and leaves before any render server shows up
    let departed = thread::spawn(move || {
        let mut manager = new_manager(test_settings());
        manager
            .initialize(ProcessRole::DataServer, Box::new(DummyController))
            .expect("[Server] Failed to initialize");
        manager
            .open_connection("127.0.0.1", data_port)
            .expect("[Server] Failed to connect to client");
        manager.finalize();
    });
    monitor_until(&mut manager, |m, _| m.pending_half_connections() == (1, 0));
    departed.join().expect("Departed server panicked");

    // The render server is not paired with the dead half
    let render_server = spawn_reverse_server(ProcessRole::RenderServer, render_port);
    monitor_until(&mut manager, |m, _| m.pending_half_connections() == (0, 1));
    assert_eq!(manager.number_of_connections(), 1);
    assert!(manager.take_events().is_empty());

    let data_server = spawn_reverse_server(ProcessRole::DataServer, data_port);
    monitor_until(&mut manager, |_, status| status == MonitorStatus::ConnectionCreated);
    let id = match manager.take_events().as_slice() {
        [ConnectionEvent::Created { id }] => *id,
        other => panic!("Unexpected events {other:?}"),
    };
    manager.stop_accepting_all_connections();

    // Both halves answer
    send(&mut manager, id, ServerFlags::DATA_SERVER, create_counter(3));
    send(&mut manager, id, ServerFlags::RENDER_SERVER, create_counter(4));
    let mut data = CounterSum::default();
    manager
        .gather_information(id, ServerFlags::DATA_SERVER, &mut data, COUNTER)
        .expect("[Client] Failed to gather from data server");
    let mut render = CounterSum::default();
    manager
        .gather_information(id, ServerFlags::RENDER_SERVER, &mut render, COUNTER)
        .expect("[Client] Failed to gather from render server");
    assert_eq!((data.total, render.total), (3, 4));

    manager.close_connection(id).expect("[Client] Failed to close");
    assert_eq!(data_server.join().expect("Data server panicked"), 1);
    assert_eq!(render_server.join().expect("Render server panicked"), 1);
}

#[test]
fn client_notices_server_leaving() {
    init_tracing();
    let mut manager = client(test_settings());
    let listener = manager
        .accept_connections_on_port(0, ServerSocketType::RenderAndDataServer)
        .expect("[Client] Failed to listen");
    let port = manager.listener_address(listener).expect("No address").port();

    // The server connects, then finalizes at once
    let server = thread::spawn(move || {
        let mut manager = new_manager(test_settings());
        manager
            .initialize(ProcessRole::CombinedServer, Box::new(DummyController))
            .expect("[Server] Failed to initialize");
        manager
            .open_connection("127.0.0.1", port)
            .expect("[Server] Failed to connect to client");
        manager.finalize();
    });

    monitor_until(&mut manager, |_, status| status == MonitorStatus::ConnectionCreated);
    server.join().expect("Server panicked");
    monitor_until(&mut manager, |_, status| status == MonitorStatus::ConnectionDropped);

    let events = manager.take_events();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[1], ConnectionEvent::Closed { .. }));
    assert_eq!(manager.number_of_connections(), 1);
}

#[test]
fn client_sweeps_connection_to_departed_server() {
    init_tracing();
    let (addr_tx, addr_rx) = mpsc::channel();

    // The server leaves right after the client connects
    let server = thread::spawn(move || {
        let mut manager = new_manager(test_settings());
        manager
            .initialize(ProcessRole::CombinedServer, Box::new(DummyController))
            .expect("[Server] Failed to initialize");
        let listener = manager
            .accept_connections_on_port(0, ServerSocketType::RenderAndDataServer)
            .expect("[Server] Failed to listen");
        let addr = manager
            .listener_address(listener)
            .expect("[Server] Listener has no address");
        addr_tx.send(addr).expect("[Server] Test thread gone");
        monitor_until(&mut manager, |_, status| status == MonitorStatus::ConnectionCreated);
        manager.finalize();
    });
    let addr = addr_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Server did not start");

    // This client never runs the monitor loop
    let mut manager = client(test_settings());
    let id = manager
        .open_connection("127.0.0.1", addr.port())
        .expect("[Client] Failed to connect");
    assert_eq!(manager.take_events(), vec![ConnectionEvent::Created { id }]);
    server.join().expect("Server panicked");

    let mut info = CounterSum::default();
    let result = manager.gather_information(id, ServerFlags::DATA_SERVER, &mut info, COUNTER);
    println!("[Client] Gather after server left: {result:?}");
    assert!(result.is_err());
    assert!(manager
        .get_connection_from_id(id)
        .is_some_and(|connection| connection.is_aborted()));

    assert_eq!(manager.drop_aborted_connections(), 1);
    assert!(manager.get_connection_from_id(id).is_none());
    assert_eq!(manager.take_events(), vec![ConnectionEvent::Closed { id }]);
    assert_eq!(manager.number_of_connections(), 1);
    assert_eq!(manager.drop_aborted_connections(), 0);
}
