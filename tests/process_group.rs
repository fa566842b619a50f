//! Process Group Tests
//!
//! Every rank is a thread with its own ConnectionManager, linked through
//! ThreadGroupController.
//!
//! # Running with tracing
//!
//! Use TEST_LOG environment variable to control tracing verbosity (like -v, -vv, -vvv):
//!
//! ```bash
//! TEST_LOG=2 cargo test --test process_group -- --nocapture
//! ```


use pmconnect::controller::{tags, Envelope, Matcher};
use pmconnect::prelude::*;
use pmconnect::ThreadGroupController;
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use test_objects::*;

static INIT: Once = Once::new();

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing based on TEST_LOG environment variable
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
// Recording Controller
// ============================================================================

/// One message as seen by the sender: (from, to, tag).
type Sent = (i32, i32, u32);

/// Passes everything to a ThreadGroupController and logs every send, in
/// global order, to a log shared by the whole group.
#[derive(Debug)]
struct RecordingController {
    inner: ThreadGroupController,
    log: Arc<Mutex<Vec<Sent>>>,
}

impl ProcessController for RecordingController {
    fn local_process_id(&self) -> i32 {
        self.inner.local_process_id()
    }

    fn number_of_processes(&self) -> i32 {
        self.inner.number_of_processes()
    }

    fn send(&mut self, destination: i32, tag: u32, data: &[u8]) -> Result<(), Error> {
        self.log
            .lock()
            .expect("Log poisoned")
            .push((self.local_process_id(), destination, tag));
        self.inner.send(destination, tag, data)
    }

    fn wait_any(
        &mut self,
        matchers: &[Matcher],
        timeout: Option<Duration>,
    ) -> Result<(usize, Envelope), Error> {
        self.inner.wait_any(matchers, timeout)
    }

    fn try_receive(&mut self, matcher: Matcher) -> Result<Option<Envelope>, Error> {
        self.inner.try_receive(matcher)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Starts ranks 1.. of `controllers` as satellites. Each thread returns
/// whether the "echo" module ended up loaded on its rank.
fn spawn_satellites<C>(controllers: Vec<C>, role: ProcessRole) -> Vec<JoinHandle<bool>>
where
    C: ProcessController + Send + 'static,
{
    controllers
        .into_iter()
        .map(|controller| {
            thread::spawn(move || {
                let mut manager = new_manager(test_settings());
                let rank = manager
                    .initialize(role, Box::new(controller))
                    .expect("Satellite failed");
                assert_ne!(rank, 0);
                println!("[Rank {rank}] Released by root");
                manager
                    .self_connection()
                    .is_some_and(|local| local.interpreter().is_module_loaded("echo"))
            })
        })
        .collect()
}

fn root_manager<C>(controller: C, role: ProcessRole) -> ConnectionManager
where
    C: ProcessController + 'static,
{
    let mut manager = new_manager(test_settings());
    let rank = manager
        .initialize(role, Box::new(controller))
        .expect("Root failed to initialize");
    assert_eq!(rank, 0);
    manager
}

fn send(manager: &mut ConnectionManager, flags: ServerFlags, mut stream: CommandStream) {
    manager
        .send_stream(ConnectionId::SELF, flags, &mut stream, true)
        .expect("Failed to send stream");
}

fn gather(manager: &mut ConnectionManager) -> CounterSum {
    let mut info = CounterSum::default();
    manager
        .gather_information(ConnectionId::SELF, ServerFlags::DATA_SERVER, &mut info, COUNTER)
        .expect("Failed to gather");
    info
}

// ============================================================================
// Root and Satellites
// ============================================================================

#[test]
fn stream_scope_on_satellites() {
    init_tracing();
    let mut controllers = ThreadGroupController::group(3);
    let root = controllers.remove(0);
    let satellites = spawn_satellites(controllers, ProcessRole::CombinedServer);
    let mut manager = root_manager(root, ProcessRole::CombinedServer);

    // All ranks: 1 each
    send(&mut manager, ServerFlags::DATA_SERVER, create_counter(1));
    assert_eq!(
        gather(&mut manager),
        CounterSum {
            total: 3,
            contributors: 3
        }
    );

    // Root only
    send(
        &mut manager,
        ServerFlags::DATA_SERVER_ROOT,
        invoke("Add", vec![Value::Int(10)]),
    );
    assert_eq!(gather(&mut manager).total, 13);

    // Both forms of the flag still run once per rank: 1 + 2 + 3
    send(
        &mut manager,
        ServerFlags::DATA_SERVER | ServerFlags::DATA_SERVER_ROOT,
        invoke("AddRank", vec![]),
    );
    assert_eq!(gather(&mut manager).total, 19);

    let result = manager
        .get_last_result(ConnectionId::SELF, ServerFlags::DATA_SERVER_ROOT)
        .expect("Failed to get last result");
    assert_eq!(result.argument(0, 0), Some(&Value::Int(12)));

    manager.finalize();
    for satellite in satellites {
        satellite.join().expect("Satellite panicked");
    }
}

#[test]
fn module_load_reaches_satellites() {
    init_tracing();
    let mut controllers = ThreadGroupController::group(3);
    let root = controllers.remove(0);
    let satellites = spawn_satellites(controllers, ProcessRole::DataServer);
    let mut manager = root_manager(root, ProcessRole::DataServer);

    manager
        .load_module(ConnectionId::SELF, "echo", "/opt/modules")
        .expect("Failed to load module");
    let mut stream = CommandStream::new();
    stream.new_object("Echo", ECHO);
    send(&mut manager, ServerFlags::DATA_SERVER, stream);

    manager.finalize();
    for satellite in satellites {
        assert!(satellite.join().expect("Satellite panicked"));
    }
}

#[test]
fn gather_follows_binary_tree() {
    init_tracing();
    const RANKS: usize = 6;
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut controllers: Vec<RecordingController> = ThreadGroupController::group(RANKS)
        .into_iter()
        .map(|inner| RecordingController {
            inner,
            log: Arc::clone(&log),
        })
        .collect();
    let root = controllers.remove(0);
    let satellites = spawn_satellites(controllers, ProcessRole::Standalone);
    let mut manager = root_manager(root, ProcessRole::Standalone);

    send(&mut manager, ServerFlags::DATA_SERVER, create_counter(0));
    send(&mut manager, ServerFlags::DATA_SERVER, invoke("AddRank", vec![]));
    log.lock().expect("Log poisoned").clear();

    let info = gather(&mut manager);
    assert_eq!(
        info,
        CounterSum {
            total: (1..=RANKS as i64).sum(),
            contributors: RANKS as u32
        }
    );

    let collects: Vec<Sent> = log
        .lock()
        .expect("Log poisoned")
        .iter()
        .copied()
        .filter(|&(_, _, tag)| tag == tags::COLLECT)
        .collect();
    println!("Collect messages: {collects:?}");

    // Every non-root rank sends exactly once, to its parent
    assert_eq!(collects.len(), RANKS - 1);
    for rank in 1..RANKS as i32 {
        let position = |from: i32| collects.iter().position(|&(f, _, _)| f == from);
        let own = position(rank).expect("Rank never reported");
        assert_eq!(collects[own].1, (rank - 1) / 2, "rank {rank} sent to wrong parent");

        // ...and only after both of its children
        for child in [2 * rank + 1, 2 * rank + 2] {
            if child < RANKS as i32 {
                let child_position = position(child).expect("Child never reported");
                assert!(child_position < own, "rank {rank} reported before child {child}");
            }
        }
    }

    manager.finalize();
    for satellite in satellites {
        satellite.join().expect("Satellite panicked");
    }
}

#[test]
fn satellite_progress_reaches_root() {
    init_tracing();
    const RANKS: i32 = 3;
    let mut controllers = ThreadGroupController::group(RANKS as usize);
    let root = controllers.remove(0);
    let satellites = spawn_satellites(controllers, ProcessRole::Standalone);
    let mut manager = root_manager(root, ProcessRole::Standalone);

    send(&mut manager, ServerFlags::DATA_SERVER, create_counter(0));
    manager
        .progress_handler_mut(ConnectionId::SELF)
        .expect("No handler")
        .register_progress_event(COUNTER, 3);
    manager
        .prepare_progress(ConnectionId::SELF)
        .expect("Failed to prepare progress");

    send(&mut manager, ServerFlags::DATA_SERVER, invoke("Work", vec![Value::Int(2)]));

    // Satellites report before they send their part of the gather, so all of
    // their progress has arrived once the gather completes.
    gather(&mut manager);

    let events = manager
        .progress_handler_mut(ConnectionId::SELF)
        .expect("No handler")
        .take_events();
    println!("Progress events: {}", events.len());
    assert_eq!(events.len(), (RANKS * 3) as usize);
    for partition in 0..RANKS {
        let reported: Vec<u8> = events
            .iter()
            .filter(|e| e.partition == partition)
            .map(|e| e.progress)
            .collect();
        assert_eq!(reported, vec![0, 50, 100], "partition {partition}");
    }
    assert!(events.iter().all(|e| e.id == 3));

    manager
        .cleanup_pending_progress(ConnectionId::SELF)
        .expect("Failed to clean up progress");
    manager.finalize();
    for satellite in satellites {
        satellite.join().expect("Satellite panicked");
    }
}

// ============================================================================
// Batch (Synchronous) Groups
// ============================================================================

#[test]
fn batch_gather_is_collective() {
    init_tracing();
    const RANKS: usize = 4;
    let ranks: Vec<JoinHandle<(i32, CounterSum)>> = ThreadGroupController::group(RANKS)
        .into_iter()
        .map(|controller| {
            thread::spawn(move || {
                let mut manager = new_manager(test_settings());
                let rank = manager
                    .initialize(ProcessRole::Batch, Box::new(controller))
                    .expect("Failed to initialize batch rank");

                // Every rank runs its own copy of the script
                send(&mut manager, ServerFlags::DATA_SERVER, create_counter(0));
                send(&mut manager, ServerFlags::DATA_SERVER, invoke("AddRank", vec![]));
                let info = gather(&mut manager);
                manager.finalize();
                (rank, info)
            })
        })
        .collect();

    let mut seen = Vec::new();
    for handle in ranks {
        let (rank, info) = handle.join().expect("Batch rank panicked");
        println!("[Rank {rank}] {info:?}");
        assert_eq!(
            info,
            CounterSum {
                total: (1..=RANKS as i64).sum(),
                contributors: RANKS as u32
            }
        );
        seen.push(rank);
    }
    seen.sort();
    assert_eq!(seen, (0..RANKS as i32).collect::<Vec<_>>());
}
