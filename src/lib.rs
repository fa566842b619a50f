//! pmconnect - Connection management and command routing for process groups
//!
//! A process plays one role: client, data server, render server, combined
//! server, standalone or batch. Its [`ConnectionManager`] owns a self
//! connection to the local process group plus any number of connections to
//! remote peers, and routes serialized [`CommandStream`]s, information
//! gathers, module loads and progress between them. Inside a process group
//! the root fans work out to its satellites through a [`ProcessController`].
//!
//! Everything is single-threaded per process: sockets are multiplexed with
//! mio in [`ConnectionManager::monitor_connections`], and requests block until
//! their reply arrives.

// Internal-only modules
pub(crate) mod codec;
pub(crate) mod config;
pub(crate) mod connection;
pub(crate) mod error;
pub(crate) mod ids;
pub(crate) mod information;
pub(crate) mod interpreter;
pub(crate) mod manager;
pub(crate) mod progress;
pub(crate) mod stream;
pub(crate) mod transport;
pub(crate) mod undo;

/// Process-group controllers and the RMI loop that runs on top of them.
pub mod controller;

// These are the intended public API
pub use config::ConnectionSettings;
pub use connection::{
    Channel, ClientConnection, Connection, FanOut, RemoteConnection, SelfConnection, SendPlan,
    ServerConnection,
};
pub use controller::{DummyController, ProcessController, ThreadGroupController};
pub use error::Error;
pub use ids::{
    ConnectionId, GroupScope, ListenerHandle, ObjectHandle, ProcessRole, ServerFlags,
    ServerSocketType,
};
pub use information::{
    Information, InformationConstructor, InformationRegistry, PartitionInformation,
    ProcessModuleInformation,
};
pub use interpreter::{
    ClassRegistry, Interpreter, InvokeContext, ModuleInitializer, ModuleRegistry,
    ObjectConstructor, ObjectTable, ProcessModule, RemoteObject,
};
pub use manager::{
    ConnectionEvent, ConnectionIterator, ConnectionManager, MonitorStatus, UndoStoreFactory,
};
pub use progress::{NullProgressObserver, ProgressEvent, ProgressHandler, ProgressObserver};
pub use stream::{Command, CommandStream, InvokeBuilder, Value};
pub use undo::{InMemoryUndoStore, UndoRedoStore};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::error::Error;
    pub use crate::ids::{ConnectionId, ObjectHandle, ProcessRole, ServerFlags, ServerSocketType};
    pub use crate::information::{Information, InformationRegistry};
    pub use crate::interpreter::{ClassRegistry, InvokeContext, ModuleRegistry, RemoteObject};
    pub use crate::manager::{ConnectionManager, MonitorStatus};
    pub use crate::stream::{CommandStream, Value};
    pub use crate::{register_class, register_information};
    pub use crate::{ConnectionSettings, DummyController, ProcessController};
}

// Re-export wire-level items that are only needed for testing
// Hidden from documentation to discourage use in production code
#[doc(hidden)]
pub use codec::{decode, encode};
#[doc(hidden)]
pub use transport::{deserialize_frame, serialize_frame, tag, Frame, Reply, Request};
