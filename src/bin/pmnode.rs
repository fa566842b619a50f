use clap::{Parser, ValueEnum};
use config::Config;
use pmconnect::prelude::*;
use pmconnect::{PartitionInformation, ThreadGroupController};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing for the pmconnect crate based on verbosity level
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => return, // No tracing
        1 => "info",
        2 => "debug",
        _ => "trace", // 3 or more
    };

    let filter = format!("pmconnect={}", level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Role {
    Client,
    Server,
    DataServer,
    RenderServer,
    Standalone,
}

impl From<Role> for ProcessRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Client => ProcessRole::Client,
            Role::Server => ProcessRole::CombinedServer,
            Role::DataServer => ProcessRole::DataServer,
            Role::RenderServer => ProcessRole::RenderServer,
            Role::Standalone => ProcessRole::Standalone,
        }
    }
}

#[derive(Parser)]
#[command(author, version, about = "Process-group node", long_about = None)]
struct Args {
    /// Role this process plays
    #[arg(short, long, value_enum, default_value = "server")]
    role: Role,

    /// Port to accept connections on (servers)
    #[arg(short, long, default_value_t = 11111)]
    port: u16,

    /// Peer to connect to instead of listening, as host:port
    #[arg(short, long)]
    connect: Option<String>,

    /// Number of processes in the local group (threads of this process)
    #[arg(short = 'n', long, default_value_t = 1)]
    processes: usize,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path (TOML format)
    #[arg(long)]
    config: Option<String>,
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> ExitCode {
    let args = Args::parse();

    init_tracing(args.verbose);

    // Create config - load from file if specified, otherwise use defaults
    let config = if let Some(config_path) = &args.config {
        match Config::builder()
            .add_source(config::File::with_name(config_path))
            .build()
        {
            Ok(c) => c,
            Err(err) => {
                eprintln!("Failed to load config file '{}': {}", config_path, err);
                return ExitCode::FAILURE;
            }
        }
    } else {
        Config::default()
    };

    // Ranks 1.. run on their own threads and never return before rank 0
    // finalizes.
    let mut controllers = ThreadGroupController::group(args.processes.max(1));
    let root = controllers.remove(0);
    let satellites: Vec<_> = controllers
        .into_iter()
        .map(|controller| {
            let config = config.clone();
            let role: ProcessRole = args.role.into();
            thread::spawn(move || {
                let mut manager = match new_manager(&config) {
                    Ok(m) => m,
                    Err(err) => {
                        eprintln!("Failed to create satellite manager: {err}");
                        return;
                    }
                };
                if let Err(err) = manager.initialize(role, Box::new(controller)) {
                    eprintln!("Satellite failed: {err}");
                }
            })
        })
        .collect();

    let result = run_root(&args, &config, root);

    for satellite in satellites {
        let _ = satellite.join();
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn new_manager(config: &Config) -> Result<ConnectionManager, Error> {
    ConnectionManager::new_named(config, "pmnode", ClassRegistry::new(), ModuleRegistry::new())
}

fn parse_peer(peer: &str) -> Result<(String, u16), Error> {
    let invalid = || Error::InvalidAddress {
        host: peer.to_string(),
        port: 0,
    };
    let (host, port) = peer.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

fn run_root(args: &Args, config: &Config, controller: ThreadGroupController) -> Result<(), Error> {
    let role: ProcessRole = args.role.into();
    let mut manager = new_manager(config)?;
    manager.initialize(role, Box::new(controller))?;

    match role {
        ProcessRole::Client => {
            let peer = args.connect.as_deref().unwrap_or("localhost:11111");
            let (host, port) = parse_peer(peer)?;
            let server = manager.open_connection(&host, port)?;
            report_partitions(&mut manager, server)
        }
        ProcessRole::Standalone => report_partitions(&mut manager, ConnectionId::SELF),
        _ => serve(args, &mut manager),
    }
}

/// Asks the servers behind `id` for their partitions and prints them.
fn report_partitions(manager: &mut ConnectionManager, id: ConnectionId) -> Result<(), Error> {
    let mut stream = CommandStream::new();
    stream
        .invoke(ObjectHandle::PROCESS_MODULE, "GetNumberOfPartitions")
        .end();
    manager.send_stream(id, ServerFlags::DATA_SERVER_ROOT, &mut stream, true)?;
    let result = manager.get_last_result(id, ServerFlags::DATA_SERVER_ROOT)?;

    let mut info = PartitionInformation::default();
    manager.gather_information(id, ServerFlags::DATA_SERVER, &mut info, ObjectHandle::PROCESS_MODULE)?;

    println!(
        "Server reports {} partitions, gathered from {:?}",
        result.argument(0, 0).and_then(Value::as_int).unwrap_or_default(),
        info.partitions
    );
    Ok(())
}

/// Runs the monitor loop until the client leaves.
fn serve(args: &Args, manager: &mut ConnectionManager) -> Result<(), Error> {
    match &args.connect {
        Some(peer) => {
            let (host, port) = parse_peer(peer)?;
            manager.open_connection(&host, port)?;
        }
        None => {
            let listener = manager.accept_connections_on_port(args.port, ServerSocketType::RenderAndDataServer)?;
            println!(
                "Listening on {}",
                manager
                    .listener_address(listener)
                    .map(|addr| addr.to_string())
                    .unwrap_or_default()
            );
        }
    }

    loop {
        match manager.monitor_connections(Some(Duration::from_millis(500)))? {
            MonitorStatus::ConnectionCreated => {
                manager.stop_accepting_all_connections();
                println!("Client connected");
            }
            MonitorStatus::ConnectionDropped => {
                println!("Client disconnected");
                break;
            }
            MonitorStatus::Processed | MonitorStatus::NoActivity => {}
        }
    }
    manager.finalize();
    Ok(())
}
