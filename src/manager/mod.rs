//! The connection manager.
//!
//! [`ConnectionManager`] owns every [`Connection`] of a process, hands out
//! [`ConnectionId`]s, accepts and opens sockets, multiplexes readiness over
//! all of them in [`monitor_connections`](ConnectionManager::monitor_connections)
//! and routes requests to connections by ID and [`ServerFlags`].
//!
//! Everything happens on the thread that owns the manager. Blocking only
//! occurs where a request waits for its reply or a process group waits for
//! its members.

mod iterator;

pub use iterator::ConnectionIterator;

use crate::config::ConnectionSettings;
use crate::connection::{
    ClientConnection, Connection, FanOut, RemoteConnection, SelfConnection, ServerConnection,
};
use crate::controller::{DummyController, ProcessController};
use crate::error::Error;
use crate::ids::{
    ConnectionId, ListenerHandle, ObjectHandle, ProcessRole, ServerFlags, ServerSocketType,
};
use crate::information::{Information, InformationRegistry};
use crate::interpreter::{ClassRegistry, ModuleRegistry};
use crate::progress::ProgressHandler;
use crate::stream::CommandStream;
use crate::transport::{connect_with_retry, Reply, Request, ServerSocket, SocketChannel};
use crate::undo::{InMemoryUndoStore, UndoRedoStore};
use ::config::Config;
use mio::{Events, Poll, Token};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

/// Outcome of one [`ConnectionManager::monitor_connections`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStatus {
    /// Nothing happened before the timeout.
    NoActivity,
    /// An inbound socket completed a connection.
    ConnectionCreated,
    /// A connection failed or its peer left, and it was removed.
    ConnectionDropped,
    /// One message was handled.
    Processed,
}

/// Lifecycle notifications, drained with [`ConnectionManager::take_events`].
/// The self connection set up by `initialize` produces none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Created { id: ConnectionId },
    Closed { id: ConnectionId },
}

/// Creates the undo store of each new client connection.
pub type UndoStoreFactory = fn() -> Box<dyn UndoRedoStore>;

fn in_memory_undo_store() -> Box<dyn UndoRedoStore> {
    Box::new(InMemoryUndoStore::new())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Listener(ListenerHandle),
    Connection(ConnectionId),
}

/// Sole owner of a process's connections.
///
/// # Example
///
/// ```no_run
/// use pmconnect::*;
///
/// let mut manager = ConnectionManager::new(
///     ConnectionSettings::default(),
///     ClassRegistry::new(),
///     ModuleRegistry::new(),
/// )?;
/// manager.initialize(ProcessRole::Client, Box::new(DummyController))?;
/// let server = manager.open_connection("localhost", 11111)?;
///
/// let mut stream = CommandStream::new();
/// stream.invoke(ObjectHandle::PROCESS_MODULE, "GetNumberOfPartitions").end();
/// manager.send_stream(server, ServerFlags::DATA_SERVER_ROOT, &mut stream, true)?;
/// let result = manager.get_last_result(server, ServerFlags::DATA_SERVER_ROOT)?;
/// println!("{:?}", result.argument(0, 0));
/// # Ok::<(), pmconnect::Error>(())
/// ```
#[derive(Debug)]
pub struct ConnectionManager {
    settings: ConnectionSettings,
    classes: ClassRegistry,
    modules: ModuleRegistry,
    information: InformationRegistry,
    undo_factory: UndoStoreFactory,
    role: ProcessRole,
    partition_id: i32,
    initialized: bool,
    connections: BTreeMap<ConnectionId, Connection>,
    listeners: BTreeMap<ListenerHandle, ServerSocket>,
    endpoints: HashMap<Token, Endpoint>,
    pending_data: VecDeque<RemoteConnection>,
    pending_render: VecDeque<RemoteConnection>,
    next_connection_id: u32,
    next_listener: usize,
    next_token: usize,
    poll: Poll,
    events: Vec<ConnectionEvent>,
}

// ============================================================================
// Constructors
// ============================================================================

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        classes: ClassRegistry,
        modules: ModuleRegistry,
    ) -> Result<Self, Error> {
        Ok(Self {
            settings,
            classes,
            modules,
            information: InformationRegistry::default(),
            undo_factory: in_memory_undo_store,
            role: ProcessRole::Standalone,
            partition_id: 0,
            initialized: false,
            connections: BTreeMap::new(),
            listeners: BTreeMap::new(),
            endpoints: HashMap::new(),
            pending_data: VecDeque::new(),
            pending_render: VecDeque::new(),
            next_connection_id: ConnectionId::FIRST_ORDINARY,
            next_listener: 1,
            next_token: 0,
            poll: Poll::new()?,
            events: Vec::new(),
        })
    }

    /// Creates a manager with settings read from `config`, looking up keys
    /// under `name` first.
    pub fn new_named(
        config: &Config,
        name: &str,
        classes: ClassRegistry,
        modules: ModuleRegistry,
    ) -> Result<Self, Error> {
        Self::new(
            ConnectionSettings::from_config_named(config, name),
            classes,
            modules,
        )
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Information types known to this process. Register custom types here
    /// before [`initialize`](Self::initialize).
    pub fn information_registry_mut(&mut self) -> &mut InformationRegistry {
        &mut self.information
    }

    pub fn set_undo_store_factory(&mut self, factory: UndoStoreFactory) {
        self.undo_factory = factory;
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn partition_id(&self) -> i32 {
        self.partition_id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

impl ConnectionManager {
    /// Creates the self connection for `role` on top of `controller` and
    /// binds it to [`ConnectionId::SELF`]. Returns the local partition id.
    ///
    /// In a process group driven from rank 0 (every role but batch), the
    /// other ranks stay inside this call executing what the root sends until
    /// the root finalizes. For them a return means the process is done.
    #[instrument(skip(self, controller))]
    pub fn initialize(
        &mut self,
        role: ProcessRole,
        controller: Box<dyn ProcessController>,
    ) -> Result<i32, Error> {
        if self.initialized {
            return Err(Error::AlreadyInitialized);
        }
        let fan_out = if role == ProcessRole::Batch {
            FanOut::Synchronous
        } else if controller.number_of_processes() > 1 {
            FanOut::RootWithSatellites
        } else {
            FanOut::Single
        };

        let mut connection = SelfConnection::new(
            ConnectionId::SELF,
            controller,
            fan_out,
            self.classes.clone(),
            self.modules.clone(),
            self.information.clone(),
            self.settings.progress_frequency,
        );
        if role.is_server() && !connection.is_satellite() && fan_out != FanOut::Synchronous {
            connection.use_relay_progress();
        }

        self.role = role;
        self.initialized = true;
        self.connections
            .insert(ConnectionId::SELF, Connection::Local(connection));

        let result = match self.connections.get_mut(&ConnectionId::SELF) {
            Some(Connection::Local(connection)) => connection.initialize(),
            _ => Err(Error::NotInitialized),
        };
        match result {
            Ok(partition_id) => {
                self.partition_id = partition_id;
                info!(%role, partition_id, ?fan_out, "Connection manager initialized");
                Ok(partition_id)
            }
            Err(err) => {
                error!(?err, "Failed to initialize self connection");
                self.connections.remove(&ConnectionId::SELF);
                self.initialized = false;
                Err(err)
            }
        }
    }

    /// Closes every listener and connection. Calling it again is a no-op.
    #[instrument(skip(self))]
    pub fn finalize(&mut self) {
        if !self.initialized && self.connections.is_empty() && self.listeners.is_empty() {
            return;
        }
        self.stop_accepting_all_connections();
        self.pending_data.clear();
        self.pending_render.clear();

        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.drop_connection(id);
        }
        self.initialized = false;
        info!("Connection manager finalized");
    }

    fn ensure_initialized(&self) -> Result<(), Error> {
        if self.initialized {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    fn allocate_id(&mut self) -> ConnectionId {
        let id = ConnectionId::from_raw(self.next_connection_id);
        self.next_connection_id += 1;
        id
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn self_connection_mut(&mut self) -> Result<&mut SelfConnection, Error> {
        self.connections
            .get_mut(&ConnectionId::SELF)
            .and_then(Connection::as_self_connection_mut)
            .ok_or(Error::NotInitialized)
    }

    /// Number of processes behind the self connection.
    fn local_partitions(&self) -> i32 {
        self.connections
            .get(&ConnectionId::SELF)
            .and_then(Connection::as_self_connection)
            .map_or(1, SelfConnection::number_of_partitions)
    }
}

// ============================================================================
// Listening
// ============================================================================

impl ConnectionManager {
    /// Starts listening on `port` for peers of `socket_type`. Does not block.
    #[instrument(skip(self))]
    pub fn accept_connections_on_port(
        &mut self,
        port: u16,
        socket_type: ServerSocketType,
    ) -> Result<ListenerHandle, Error> {
        self.ensure_initialized()?;
        if self.role.is_self_contained() {
            return Err(Error::InvalidRole {
                operation: "accept_connections_on_port",
                role: self.role.to_string(),
            });
        }

        let mut socket = ServerSocket::bind(port, socket_type)?;
        let token = self.allocate_token();
        socket.register(self.poll.registry(), token)?;

        let handle = ListenerHandle(self.next_listener);
        self.next_listener += 1;
        self.endpoints.insert(token, Endpoint::Listener(handle));
        self.listeners.insert(handle, socket);
        debug!(%handle, "Listener registered");
        Ok(handle)
    }

    /// Local address of a listener; useful after binding port 0.
    pub fn listener_address(&self, handle: ListenerHandle) -> Option<SocketAddr> {
        self.listeners.get(&handle).map(ServerSocket::local_addr)
    }

    #[instrument(skip(self))]
    pub fn stop_accepting_connections(&mut self, handle: ListenerHandle) -> Result<(), Error> {
        match self.listeners.remove(&handle) {
            Some(_) => {
                self.endpoints
                    .retain(|_, endpoint| *endpoint != Endpoint::Listener(handle));
                Ok(())
            }
            None => {
                warn!(%handle, "Listener not found");
                Err(Error::ListenerNotFound { handle: handle.raw() })
            }
        }
    }

    /// Closes every listener. Safe to call when there are none.
    pub fn stop_accepting_all_connections(&mut self) {
        if self.listeners.is_empty() {
            return;
        }
        debug!(count = self.listeners.len(), "Closing all listeners");
        self.listeners.clear();
        self.endpoints
            .retain(|_, endpoint| !matches!(endpoint, Endpoint::Listener(_)));
    }

    /// Accepted sockets still waiting for their partner: (data, render).
    pub fn pending_half_connections(&self) -> (usize, usize) {
        (self.pending_data.len(), self.pending_render.len())
    }

    fn accept_on(&mut self, handle: ListenerHandle) -> usize {
        let Some(listener) = self.listeners.get_mut(&handle) else {
            return 0;
        };
        let socket_type = listener.socket_type();
        let streams = match listener.accept_pending() {
            Ok(streams) => streams,
            Err(err) => {
                error!(%handle, ?err, "Listener failed, closing it");
                let _ = self.stop_accepting_connections(handle);
                return 0;
            }
        };

        let mut created = 0;
        for stream in streams {
            match self.accept_stream(stream, socket_type) {
                Ok(Some(_)) => created += 1,
                Ok(None) => {}
                Err(err) => warn!(?err, "Discarding inbound connection"),
            }
        }
        created
    }

    /// Handshakes an accepted socket and turns it into a connection, or
    /// queues it until its data/render partner arrives.
    fn accept_stream(
        &mut self,
        stream: TcpStream,
        socket_type: ServerSocketType,
    ) -> Result<Option<ConnectionId>, Error> {
        let channel = SocketChannel::new(stream, self.settings.max_read_size)?;
        let link = RemoteConnection::accept(
            channel,
            &self.settings,
            self.role,
            self.local_partitions(),
        )?;

        if self.role != ProcessRole::Client {
            return self.add_client_connection(link).map(Some);
        }

        match socket_type {
            ServerSocketType::RenderAndDataServer => self.add_server_connection(link, None).map(Some),
            ServerSocketType::DataServer => match pop_live_half(&mut self.pending_render) {
                Some(render) => self.add_server_connection(link, Some(render)).map(Some),
                None => {
                    debug!(peer = %link.peer_addr(), "Data server waiting for render server");
                    self.pending_data.push_back(link);
                    Ok(None)
                }
            },
            ServerSocketType::RenderServer => match pop_live_half(&mut self.pending_data) {
                Some(data) => self.add_server_connection(data, Some(link)).map(Some),
                None => {
                    debug!(peer = %link.peer_addr(), "Render server waiting for data server");
                    self.pending_render.push_back(link);
                    Ok(None)
                }
            },
        }
    }
}

/// Takes the oldest queued half whose peer is still there. Halves are not in
/// the poll set, so a peer that left while queued is only noticed here.
fn pop_live_half(queue: &mut VecDeque<RemoteConnection>) -> Option<RemoteConnection> {
    while let Some(mut half) = queue.pop_front() {
        match half.channel_mut().poll_frame() {
            Ok(None) => return Some(half),
            // A server never speaks first; this is its goodbye
            Ok(Some(frame)) => {
                info!(peer = %half.peer_addr(), tag = frame.tag(), "Discarding half connection")
            }
            Err(err) => info!(peer = %half.peer_addr(), ?err, "Discarding half connection"),
        }
    }
    None
}

// ============================================================================
// Opening Connections
// ============================================================================

impl ConnectionManager {
    /// Connects to a peer, handshakes and registers the connection.
    ///
    /// A client gets a [`ServerConnection`]; a server connecting back to
    /// its client gets a [`ClientConnection`]. Connect attempts are retried
    /// within the configured window.
    #[instrument(skip(self))]
    pub fn open_connection(&mut self, host: &str, port: u16) -> Result<ConnectionId, Error> {
        self.ensure_initialized()?;
        if self.role.is_self_contained() {
            return Err(Error::InvalidRole {
                operation: "open_connection",
                role: self.role.to_string(),
            });
        }
        let link = self.connect(host, port)?;
        if self.role == ProcessRole::Client {
            self.add_server_connection(link, None)
        } else {
            self.add_client_connection(link)
        }
    }

    /// Client only: connects to a data server and a separate render server
    /// and joins both into one connection.
    #[instrument(skip(self))]
    pub fn open_connection_pair(
        &mut self,
        data_host: &str,
        data_port: u16,
        render_host: &str,
        render_port: u16,
    ) -> Result<ConnectionId, Error> {
        self.ensure_initialized()?;
        if self.role != ProcessRole::Client {
            return Err(Error::InvalidRole {
                operation: "open_connection_pair",
                role: self.role.to_string(),
            });
        }
        let data = self.connect(data_host, data_port)?;
        let render = self.connect(render_host, render_port)?;
        self.add_server_connection(data, Some(render))
    }

    fn connect(&self, host: &str, port: u16) -> Result<RemoteConnection, Error> {
        let stream = connect_with_retry(
            host,
            port,
            self.settings.connect_retry_timeout,
            self.settings.connect_retry_interval,
        )?;
        let channel = SocketChannel::new(stream, self.settings.max_read_size)?;
        RemoteConnection::initiate(channel, &self.settings, self.role)
    }

    /// Creates another independent single-process self connection.
    #[instrument(skip(self))]
    pub fn open_self_connection(&mut self) -> Result<ConnectionId, Error> {
        self.ensure_initialized()?;
        let id = self.allocate_id();
        let mut connection = SelfConnection::new(
            id,
            Box::new(DummyController),
            FanOut::Single,
            self.classes.clone(),
            self.modules.clone(),
            self.information.clone(),
            self.settings.progress_frequency,
        );
        connection.initialize()?;
        self.insert_connection(Connection::Local(connection))
    }

    fn add_server_connection(
        &mut self,
        data: RemoteConnection,
        render: Option<RemoteConnection>,
    ) -> Result<ConnectionId, Error> {
        let id = self.allocate_id();
        let connection = ServerConnection::new(id, data, render, &self.settings);
        self.insert_connection(Connection::Server(connection))
    }

    fn add_client_connection(&mut self, link: RemoteConnection) -> Result<ConnectionId, Error> {
        let id = self.allocate_id();
        let connection = ClientConnection::new(id, link, (self.undo_factory)());
        self.insert_connection(Connection::Client(connection))
    }

    fn insert_connection(&mut self, mut connection: Connection) -> Result<ConnectionId, Error> {
        let id = connection.id();
        for socket in connection.sockets_mut() {
            let token = self.allocate_token();
            socket.register(self.poll.registry(), token)?;
            self.endpoints.insert(token, Endpoint::Connection(id));
        }
        self.connections.insert(id, connection);
        self.events.push(ConnectionEvent::Created { id });
        info!(%id, "Connection created");
        Ok(id)
    }
}

// ============================================================================
// Monitoring
// ============================================================================

impl ConnectionManager {
    /// Waits up to `timeout` (forever for `None`) for socket activity and
    /// handles it: inbound sockets become connections, and one pending
    /// message is dispatched to its connection. Connections that fail are
    /// dropped.
    pub fn monitor_connections(&mut self, timeout: Option<Duration>) -> Result<MonitorStatus, Error> {
        self.ensure_initialized()?;

        // Frames left over from an earlier read produce no new readiness.
        if let Some(status) = self.service_next() {
            return Ok(status);
        }
        if self.endpoints.is_empty() {
            trace!("Nothing to monitor");
            return Ok(MonitorStatus::NoActivity);
        }

        let mut events = Events::with_capacity(self.settings.poll_capacity);
        if let Err(err) = self.poll.poll(&mut events, timeout) {
            if err.kind() == ErrorKind::Interrupted {
                return Ok(MonitorStatus::NoActivity);
            }
            error!(?err, "Poll failed");
            return Err(Error::PollError(err.to_string()));
        }

        let tokens: Vec<Token> = events.iter().map(|event| event.token()).collect();
        if tokens.is_empty() {
            return Ok(MonitorStatus::NoActivity);
        }

        let mut created = 0;
        for token in tokens {
            match self.endpoints.get(&token).copied() {
                Some(Endpoint::Listener(handle)) => created += self.accept_on(handle),
                Some(Endpoint::Connection(id)) => self.read_connection(id),
                None => trace!(?token, "Event for closed endpoint"),
            }
        }
        if created > 0 {
            return Ok(MonitorStatus::ConnectionCreated);
        }
        Ok(self.service_next().unwrap_or(MonitorStatus::NoActivity))
    }

    fn read_connection(&mut self, id: ConnectionId) {
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        let failed = connection
            .sockets_mut()
            .into_iter()
            .map(|socket| socket.fill_nonblocking())
            .find_map(Result::err);
        if let Some(err) = failed {
            warn!(%id, ?err, "Socket error");
            connection.abort();
        }
    }

    /// Handles the first connection that is aborted or has a frame waiting.
    fn service_next(&mut self) -> Option<MonitorStatus> {
        let id = self
            .connections
            .iter()
            .find(|(_, c)| !c.is_local() && (c.is_aborted() || c.needs_attention()))
            .map(|(id, _)| *id)?;
        Some(self.process_connection(id))
    }

    fn process_connection(&mut self, id: ConnectionId) -> MonitorStatus {
        let result = match self.connections.get_mut(&id) {
            Some(connection) if connection.is_aborted() => Err(Error::Aborted { id: id.raw() }),
            Some(Connection::Server(server)) => server.process_communication().map(|_| None),
            Some(Connection::Client(client)) => client.process_communication(),
            _ => Ok(None),
        };

        match result {
            Ok(None) => MonitorStatus::Processed,
            Ok(Some(request)) => match self.serve_request(id, request) {
                Ok(()) => MonitorStatus::Processed,
                Err(err) if err.is_fatal_to_connection() => {
                    warn!(%id, ?err, "Failed to answer client");
                    self.drop_connection(id);
                    MonitorStatus::ConnectionDropped
                }
                Err(err) => {
                    warn!(%id, ?err, "Request failed");
                    MonitorStatus::Processed
                }
            },
            Err(err) => {
                info!(%id, ?err, "Dropping connection");
                self.drop_connection(id);
                MonitorStatus::ConnectionDropped
            }
        }
    }
}

// ============================================================================
// Serving Client Requests
// ============================================================================

impl ConnectionManager {
    /// Executes a client's request on the self connection and answers it.
    #[instrument(skip(self, request), fields(%client))]
    fn serve_request(&mut self, client: ConnectionId, request: Request) -> Result<(), Error> {
        match request {
            Request::Stream { servers, data } => {
                let stream = CommandStream::from_data(&data)?;
                let flags = ServerFlags::from_bits_truncate(servers);
                debug!(?flags, len = stream.len(), "Executing stream for client");
                if let Err(err) = self.run_for_client(client, |local| local.send_stream(flags, &stream)) {
                    warn!(?err, "Stream from client failed");
                }
                Ok(())
            }
            Request::Gather {
                servers,
                info_tag,
                handle,
            } => {
                let flags = ServerFlags::from_bits_truncate(servers);
                match self.gather_for_client(client, flags, &info_tag, handle) {
                    Ok(data) => self.reply(client, Reply::Information { data }),
                    Err(err) => {
                        warn!(?err, info = %info_tag, "Gather for client failed");
                        self.send_exception(client, &err.to_string())
                    }
                }
            }
            Request::LastResult { .. } => {
                let data = self.self_connection_mut()?.last_result().data()?;
                self.reply(client, Reply::LastResult { data })
            }
            Request::LoadModule {
                name, directory, ..
            } => {
                let loaded = self.self_connection_mut()?.load_module(&name, &directory);
                if let Err(err) = &loaded {
                    warn!(?err, %name, "Module load for client failed");
                }
                self.reply(client, Reply::ModuleLoaded { ok: loaded.is_ok() })
            }
            Request::PrepareProgress => self.run_for_client(client, |local| {
                local.prepare_progress();
                Ok(())
            }),
            Request::CleanupProgress => {
                self.run_for_client(client, |local| {
                    local.cleanup_pending_progress();
                    Ok(())
                })?;
                self.reply(client, Reply::ProgressCleaned)
            }
            other => {
                warn!(?other, "Request cannot be served by the process group");
                Err(Error::UnexpectedTag(crate::transport::tag::RMI))
            }
        }
    }

    fn gather_for_client(
        &mut self,
        client: ConnectionId,
        flags: ServerFlags,
        info_tag: &str,
        handle: ObjectHandle,
    ) -> Result<Vec<u8>, Error> {
        let mut info = self.information.create(info_tag)?;
        self.run_for_client(client, |local| {
            local.gather_information(flags, info.as_mut(), handle)
        })?;
        info.copy_to_stream()
    }

    /// Runs `op` on the self connection with progress going to `client`.
    fn run_for_client<T>(
        &mut self,
        client: ConnectionId,
        op: impl FnOnce(&mut SelfConnection) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let writer = match self.connections.get(&client) {
            Some(Connection::Client(connection)) => match connection.progress_writer() {
                Ok(writer) => Some(writer),
                Err(err) => {
                    warn!(?err, "No progress channel to client");
                    None
                }
            },
            _ => None,
        };
        let local = self.self_connection_mut()?;
        local.set_progress_sink(writer);
        let result = op(local);
        local.set_progress_sink(None);
        result
    }

    fn client_connection_mut(&mut self, id: ConnectionId) -> Result<&mut ClientConnection, Error> {
        self.connections
            .get_mut(&id)
            .and_then(Connection::as_client_connection_mut)
            .ok_or(Error::ConnectionNotFound { id: id.raw() })
    }

    fn reply(&mut self, client: ConnectionId, reply: Reply) -> Result<(), Error> {
        self.client_connection_mut(client)?.reply(reply)
    }

    fn send_exception(&mut self, client: ConnectionId, message: &str) -> Result<(), Error> {
        self.client_connection_mut(client)?.send_exception(message)
    }
}

// ============================================================================
// Routing
// ============================================================================

impl ConnectionManager {
    /// A cursor over the connections.
    pub fn new_iterator(&self) -> ConnectionIterator<'_> {
        ConnectionIterator::new(self)
    }

    pub(crate) fn connection_ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.connections.keys().copied()
    }

    fn resolve(&self, id: ConnectionId) -> Vec<ConnectionId> {
        let mut iter = self.new_iterator();
        iter.set_match_connection_id(id);
        iter.collect()
    }

    /// The single connection standing for `id`.
    fn resolve_root(&self, id: ConnectionId) -> Result<ConnectionId, Error> {
        let mut iter = self.new_iterator();
        iter.set_match_connection_id(self.get_root_connection(id));
        iter.begin();
        match iter.current_connection_id() {
            ConnectionId::NULL => {
                warn!(%id, "No connection matches");
                Err(Error::ConnectionNotFound { id: id.raw() })
            }
            resolved => Ok(resolved),
        }
    }

    fn resolved_connection_mut(&mut self, id: ConnectionId) -> Result<&mut Connection, Error> {
        let resolved = self.resolve_root(id)?;
        self.connections
            .get_mut(&resolved)
            .ok_or(Error::ConnectionNotFound { id: id.raw() })
    }

    /// Maps a group ID to the ID of the one connection representing it:
    /// all connections to self, all servers to the root server.
    pub fn get_root_connection(&self, id: ConnectionId) -> ConnectionId {
        match id {
            ConnectionId::ALL => ConnectionId::SELF,
            ConnectionId::ALL_SERVERS => ConnectionId::ROOT_SERVER,
            other => other,
        }
    }

    /// Whether `id` counts as a server connection. Remote connections always
    /// do. Self connections do only in standalone and batch processes, where
    /// the local group is the server.
    pub fn is_server_connection(&self, id: ConnectionId) -> bool {
        match self.connections.get(&id) {
            Some(Connection::Local(_)) => self.role.is_self_contained(),
            Some(_) => true,
            None => false,
        }
    }

    /// Sends `stream` to every connection `id` stands for. With
    /// [`ServerFlags::CLIENT`] set, the stream also runs on the self
    /// connection if that was not among the targets. `stream` is cleared
    /// afterwards when `reset_after_send` is set, whatever the outcome.
    #[instrument(skip(self, stream), fields(len = stream.len()))]
    pub fn send_stream(
        &mut self,
        id: ConnectionId,
        flags: ServerFlags,
        stream: &mut CommandStream,
        reset_after_send: bool,
    ) -> Result<(), Error> {
        let result = self.route_stream(id, flags, stream);
        if reset_after_send {
            stream.reset();
        }
        result
    }

    fn route_stream(
        &mut self,
        id: ConnectionId,
        flags: ServerFlags,
        stream: &CommandStream,
    ) -> Result<(), Error> {
        self.ensure_initialized()?;
        let targets = self.resolve(id);
        if targets.is_empty() && !flags.contains(ServerFlags::CLIENT) {
            warn!(%id, "No connection matches");
            return Err(Error::ConnectionNotFound { id: id.raw() });
        }

        let mut reached_self = false;
        let mut first_error = None;
        for target in targets {
            let Some(connection) = self.connections.get_mut(&target) else {
                continue;
            };
            reached_self |= target == ConnectionId::SELF;
            trace!(%target, ?flags, "Routing stream");
            if let Err(err) = connection.send_stream(flags, stream) {
                error!(%target, ?err, "Failed to send stream");
                first_error.get_or_insert(err);
            }
        }

        if flags.contains(ServerFlags::CLIENT) && !reached_self {
            trace!("Running stream locally for client flag");
            if let Err(err) = self
                .self_connection_mut()?
                .send_stream(ServerFlags::CLIENT, stream)
            {
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Gathers `info` from the object `handle` through the connection
    /// representing `id`.
    #[instrument(skip(self, info), fields(info = info.type_tag()))]
    pub fn gather_information(
        &mut self,
        id: ConnectionId,
        flags: ServerFlags,
        info: &mut dyn Information,
        handle: ObjectHandle,
    ) -> Result<(), Error> {
        self.ensure_initialized()?;
        self.resolved_connection_mut(id)?
            .gather_information(flags, info, handle)
            .inspect_err(|err| error!(%id, ?err, "Gather failed"))
    }

    /// The result of the last invoke executed through the connection.
    pub fn get_last_result(
        &mut self,
        id: ConnectionId,
        flags: ServerFlags,
    ) -> Result<CommandStream, Error> {
        self.ensure_initialized()?;
        self.resolved_connection_mut(id)?.last_result(flags)
    }

    #[instrument(skip(self))]
    pub fn load_module(&mut self, id: ConnectionId, name: &str, directory: &str) -> Result<(), Error> {
        self.ensure_initialized()?;
        self.resolved_connection_mut(id)?
            .load_module(name, directory)
            .inspect_err(|err| error!(?err, "Module load failed"))
    }

    pub fn prepare_progress(&mut self, id: ConnectionId) -> Result<(), Error> {
        self.ensure_initialized()?;
        self.resolved_connection_mut(id)?.prepare_progress()
    }

    pub fn cleanup_pending_progress(&mut self, id: ConnectionId) -> Result<(), Error> {
        self.ensure_initialized()?;
        self.resolved_connection_mut(id)?.cleanup_pending_progress()
    }

    pub fn progress_handler_mut(&mut self, id: ConnectionId) -> Option<&mut ProgressHandler> {
        let resolved = self.resolve_root(id).ok()?;
        self.connections
            .get_mut(&resolved)
            .map(Connection::progress_handler_mut)
    }

    /// Stores an undo step on the server behind `id`.
    pub fn push_undo(&mut self, id: ConnectionId, label: &str, xml: &str) -> Result<(), Error> {
        self.server_connection_mut(id, "push_undo")?
            .push_undo(label, xml)
    }

    /// Steps the undo stack on the server behind `id`.
    pub fn pull_undo(&mut self, id: ConnectionId, redo: bool) -> Result<Option<String>, Error> {
        self.server_connection_mut(id, "pull_undo")?.pull_undo(redo)
    }

    fn server_connection_mut(
        &mut self,
        id: ConnectionId,
        operation: &'static str,
    ) -> Result<&mut ServerConnection, Error> {
        self.ensure_initialized()?;
        let role = self.role.to_string();
        self.resolved_connection_mut(id)?
            .as_server_connection_mut()
            .ok_or(Error::InvalidRole { operation, role })
    }
}

// ============================================================================
// Lookup and Removal
// ============================================================================

impl ConnectionManager {
    pub fn number_of_connections(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_connection_from_id(&self, id: ConnectionId) -> Option<&Connection> {
        let connection = self.connections.get(&id);
        if connection.is_none() {
            warn!(%id, "Connection not found");
        }
        connection
    }

    pub fn get_connection_from_id_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        let connection = self.connections.get_mut(&id);
        if connection.is_none() {
            warn!(%id, "Connection not found");
        }
        connection
    }

    /// ID of a connection owned by this manager, [`ConnectionId::NULL`] for
    /// any other.
    pub fn get_connection_id(&self, connection: &Connection) -> ConnectionId {
        match self.connections.get(&connection.id()) {
            Some(owned) if std::ptr::eq(owned, connection) => connection.id(),
            _ => ConnectionId::NULL,
        }
    }

    /// The self connection, once initialized.
    pub fn self_connection(&self) -> Option<&SelfConnection> {
        self.connections
            .get(&ConnectionId::SELF)
            .and_then(Connection::as_self_connection)
    }

    /// Removes and returns the lifecycle events queued so far.
    pub fn take_events(&mut self) -> Vec<ConnectionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Finalizes and removes a connection. The self connection only goes
    /// away with [`finalize`](Self::finalize).
    pub fn close_connection(&mut self, id: ConnectionId) -> Result<(), Error> {
        if id == ConnectionId::SELF {
            return Err(Error::InvalidRole {
                operation: "close_connection",
                role: "self connection".to_string(),
            });
        }
        if !self.connections.contains_key(&id) {
            warn!(%id, "Connection not found");
            return Err(Error::ConnectionNotFound { id: id.raw() });
        }
        self.drop_connection(id);
        Ok(())
    }

    /// Drops every aborted connection. For processes that do not run
    /// [`monitor_connections`](Self::monitor_connections) themselves.
    pub fn drop_aborted_connections(&mut self) -> usize {
        let aborted: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, connection)| connection.is_aborted())
            .map(|(id, _)| *id)
            .collect();
        for &id in &aborted {
            self.drop_connection(id);
        }
        if !aborted.is_empty() {
            debug!(count = aborted.len(), "Dropped aborted connections");
        }
        aborted.len()
    }

    fn drop_connection(&mut self, id: ConnectionId) {
        let Some(mut connection) = self.connections.remove(&id) else {
            return;
        };
        connection.finalize();
        self.endpoints
            .retain(|_, endpoint| *endpoint != Endpoint::Connection(id));
        // Sockets close when the connection drops here.
        drop(connection);
        if id != ConnectionId::SELF {
            self.events.push(ConnectionEvent::Closed { id });
        }
        info!(%id, "Connection dropped");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.finalize();
    }
}
