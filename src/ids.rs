//! Identifiers and flag sets shared across the crate.

use bincode::{Decode, Encode};
use bitflags::bitflags;
use std::fmt;

// ============================================================================
// ConnectionId
// ============================================================================

/// Opaque identifier of a connection owned by the
/// [`ConnectionManager`](crate::ConnectionManager).
///
/// The first few values are reserved. Besides [`NULL`](Self::NULL) and
/// [`SELF`](Self::SELF) they name logical groups rather than single
/// connections; the manager resolves them when routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u32);

impl ConnectionId {
    /// No connection.
    pub const NULL: ConnectionId = ConnectionId(0);
    /// The always-present local connection.
    pub const SELF: ConnectionId = ConnectionId(1);
    /// Every connection.
    pub const ALL: ConnectionId = ConnectionId(2);
    /// Every connection that counts as a server connection.
    pub const ALL_SERVERS: ConnectionId = ConnectionId(3);
    /// The first server connection.
    pub const ROOT_SERVER: ConnectionId = ConnectionId(4);

    pub(crate) const FIRST_ORDINARY: u32 = 5;

    pub const fn from_raw(raw: u32) -> Self {
        ConnectionId(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    /// Whether the ID names a group instead of a single connection.
    pub fn is_group(self) -> bool {
        matches!(self, Self::ALL | Self::ALL_SERVERS | Self::ROOT_SERVER)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NULL => write!(f, "null"),
            Self::SELF => write!(f, "self"),
            Self::ALL => write!(f, "all"),
            Self::ALL_SERVERS => write!(f, "all-servers"),
            Self::ROOT_SERVER => write!(f, "root-server"),
            ConnectionId(raw) => write!(f, "{raw}"),
        }
    }
}

// ============================================================================
// ServerFlags
// ============================================================================

bitflags! {
    /// Logical destinations of a request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ServerFlags: u32 {
        /// Every data-server process.
        const DATA_SERVER = 0x01;
        /// Only the root data-server process.
        const DATA_SERVER_ROOT = 0x02;
        /// Every render-server process.
        const RENDER_SERVER = 0x04;
        /// Only the root render-server process.
        const RENDER_SERVER_ROOT = 0x08;
        /// The client process.
        const CLIENT = 0x10;

        const SERVERS = Self::DATA_SERVER.bits() | Self::RENDER_SERVER.bits();
        const CLIENT_AND_SERVERS = Self::CLIENT.bits() | Self::SERVERS.bits();
    }
}

/// How far a request travels inside one process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupScope {
    /// Root process only.
    Root,
    /// Every process of the group.
    All,
}

impl ServerFlags {
    /// Scope of the data-server part of the flags. The all-processes form wins
    /// when both forms are present.
    pub fn data_scope(self) -> Option<GroupScope> {
        scope_of(self, Self::DATA_SERVER, Self::DATA_SERVER_ROOT)
    }

    /// Scope of the render-server part of the flags.
    pub fn render_scope(self) -> Option<GroupScope> {
        scope_of(self, Self::RENDER_SERVER, Self::RENDER_SERVER_ROOT)
    }

    /// Scope over any server group, used where data and render processes are
    /// the same processes.
    pub fn server_scope(self) -> Option<GroupScope> {
        match (self.data_scope(), self.render_scope()) {
            (Some(GroupScope::All), _) | (_, Some(GroupScope::All)) => Some(GroupScope::All),
            (None, None) => None,
            _ => Some(GroupScope::Root),
        }
    }

    /// Whether the flags address the render server.
    pub fn wants_render_server(self) -> bool {
        self.intersects(Self::RENDER_SERVER | Self::RENDER_SERVER_ROOT)
    }
}

fn scope_of(flags: ServerFlags, all: ServerFlags, root: ServerFlags) -> Option<GroupScope> {
    if flags.contains(all) {
        Some(GroupScope::All)
    } else if flags.contains(root) {
        Some(GroupScope::Root)
    } else {
        None
    }
}

// ============================================================================
// ServerSocketType
// ============================================================================

/// Kind of peer a listening socket expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerSocketType {
    RenderServer,
    DataServer,
    RenderAndDataServer,
}

// ============================================================================
// ListenerHandle
// ============================================================================

/// Handle of a listening socket. Separate namespace from [`ConnectionId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerHandle(pub(crate) usize);

impl ListenerHandle {
    pub fn raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// ObjectHandle
// ============================================================================

/// Handle of an object living in an [`Interpreter`](crate::Interpreter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct ObjectHandle(pub u64);

impl ObjectHandle {
    pub const NULL: ObjectHandle = ObjectHandle(0);
    /// The built-in process-module object present in every interpreter.
    pub const PROCESS_MODULE: ObjectHandle = ObjectHandle(1);
    /// First handle callers may allocate.
    pub const FIRST_USER: ObjectHandle = ObjectHandle(100);
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// ProcessRole
// ============================================================================

/// The part a process plays in the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum ProcessRole {
    /// Single process, or an MPI group driven from rank 0.
    Standalone,
    /// MPI group where every rank runs the same driving logic.
    Batch,
    /// Interactive client connected to remote servers.
    Client,
    DataServer,
    RenderServer,
    /// One server process group serving both data and rendering.
    CombinedServer,
}

impl ProcessRole {
    /// Whether this is one of the server roles.
    pub fn is_server(self) -> bool {
        matches!(
            self,
            ProcessRole::DataServer | ProcessRole::RenderServer | ProcessRole::CombinedServer
        )
    }

    /// Whether the process runs without a client/server split.
    pub fn is_self_contained(self) -> bool {
        matches!(self, ProcessRole::Standalone | ProcessRole::Batch)
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessRole::Standalone => "standalone",
            ProcessRole::Batch => "batch",
            ProcessRole::Client => "client",
            ProcessRole::DataServer => "data-server",
            ProcessRole::RenderServer => "render-server",
            ProcessRole::CombinedServer => "combined-server",
        };
        f.write_str(name)
    }
}
