//! Connections owned by the [`ConnectionManager`](crate::ConnectionManager).
//!
//! A [`Connection`] is one logical endpoint: the local process group
//! ([`SelfConnection`]), the servers seen from a client
//! ([`ServerConnection`]) or the client seen from a server
//! ([`ClientConnection`]). Behavior differences are carried by the variant
//! and, for self connections, by a [`FanOut`] policy.

mod client;
mod remote;
mod self_connection;
mod server;

pub use client::ClientConnection;
pub use remote::RemoteConnection;
pub use self_connection::{FanOut, SelfConnection};
pub use server::{Channel, SendPlan, ServerConnection};

use crate::error::Error;
use crate::ids::{ConnectionId, ObjectHandle, ServerFlags};
use crate::information::Information;
use crate::progress::ProgressHandler;
use crate::stream::CommandStream;
use crate::transport::SocketChannel;

/// One endpoint managed by the connection manager.
#[derive(Debug)]
pub enum Connection {
    Local(SelfConnection),
    Server(ServerConnection),
    Client(ClientConnection),
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        match self {
            Connection::Local(c) => c.id(),
            Connection::Server(c) => c.id(),
            Connection::Client(c) => c.id(),
        }
    }

    /// Whether this is a connection to the local process group.
    pub fn is_local(&self) -> bool {
        matches!(self, Connection::Local(_))
    }

    /// Set after a transport or protocol failure. An aborted connection is
    /// never used again.
    pub fn is_aborted(&self) -> bool {
        match self {
            Connection::Local(c) => c.is_aborted(),
            Connection::Server(c) => c.is_aborted(),
            Connection::Client(c) => c.is_aborted(),
        }
    }

    pub(crate) fn abort(&mut self) {
        match self {
            Connection::Local(c) => c.abort(),
            Connection::Server(c) => c.abort(),
            Connection::Client(c) => c.abort(),
        }
    }

    pub fn progress_handler(&self) -> &ProgressHandler {
        match self {
            Connection::Local(c) => c.progress_handler(),
            Connection::Server(c) => c.progress_handler(),
            Connection::Client(c) => c.progress_handler(),
        }
    }

    pub fn progress_handler_mut(&mut self) -> &mut ProgressHandler {
        match self {
            Connection::Local(c) => c.progress_handler_mut(),
            Connection::Server(c) => c.progress_handler_mut(),
            Connection::Client(c) => c.progress_handler_mut(),
        }
    }

    pub fn as_self_connection(&self) -> Option<&SelfConnection> {
        match self {
            Connection::Local(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_server_connection(&self) -> Option<&ServerConnection> {
        match self {
            Connection::Server(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_client_connection(&self) -> Option<&ClientConnection> {
        match self {
            Connection::Client(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_self_connection_mut(&mut self) -> Option<&mut SelfConnection> {
        match self {
            Connection::Local(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_server_connection_mut(&mut self) -> Option<&mut ServerConnection> {
        match self {
            Connection::Server(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_client_connection_mut(&mut self) -> Option<&mut ClientConnection> {
        match self {
            Connection::Client(c) => Some(c),
            _ => None,
        }
    }

    pub fn send_stream(&mut self, flags: ServerFlags, stream: &CommandStream) -> Result<(), Error> {
        match self {
            Connection::Local(c) => c.send_stream(flags, stream),
            Connection::Server(c) => c.send_stream(flags, stream),
            Connection::Client(c) => c.send_stream(flags, stream),
        }
    }

    pub fn gather_information(
        &mut self,
        flags: ServerFlags,
        info: &mut dyn Information,
        handle: ObjectHandle,
    ) -> Result<(), Error> {
        match self {
            Connection::Local(c) => c.gather_information(flags, info, handle),
            Connection::Server(c) => c.gather_information(flags, info, handle),
            Connection::Client(_) => Err(not_on_client("gather_information")),
        }
    }

    pub fn last_result(&mut self, flags: ServerFlags) -> Result<CommandStream, Error> {
        match self {
            Connection::Local(c) => Ok(c.last_result()),
            Connection::Server(c) => c.last_result(flags),
            Connection::Client(_) => Err(not_on_client("last_result")),
        }
    }

    pub fn load_module(&mut self, name: &str, directory: &str) -> Result<(), Error> {
        match self {
            Connection::Local(c) => c.load_module(name, directory),
            Connection::Server(c) => c.load_module(name, directory),
            Connection::Client(_) => Err(not_on_client("load_module")),
        }
    }

    pub fn prepare_progress(&mut self) -> Result<(), Error> {
        match self {
            Connection::Local(c) => {
                c.prepare_progress();
                Ok(())
            }
            Connection::Server(c) => c.prepare_progress(),
            Connection::Client(c) => {
                c.progress_handler_mut().prepare_progress();
                Ok(())
            }
        }
    }

    pub fn cleanup_pending_progress(&mut self) -> Result<(), Error> {
        match self {
            Connection::Local(c) => {
                c.cleanup_pending_progress();
                Ok(())
            }
            Connection::Server(c) => c.cleanup_pending_progress(),
            Connection::Client(c) => {
                c.progress_handler_mut().cleanup_pending_progress();
                Ok(())
            }
        }
    }

    /// Releases the connection's peers. Safe to call more than once.
    pub fn finalize(&mut self) {
        match self {
            Connection::Local(c) => c.finalize(),
            Connection::Server(c) => c.finalize(),
            Connection::Client(c) => c.finalize(),
        }
    }

    pub(crate) fn sockets_mut(&mut self) -> Vec<&mut SocketChannel> {
        match self {
            Connection::Local(_) => Vec::new(),
            Connection::Server(c) => c.sockets_mut().collect(),
            Connection::Client(c) => c.sockets_mut().collect(),
        }
    }

    pub(crate) fn needs_attention(&self) -> bool {
        match self {
            Connection::Local(_) => false,
            Connection::Server(c) => c.needs_attention(),
            Connection::Client(c) => c.needs_attention(),
        }
    }
}

fn not_on_client(operation: &'static str) -> Error {
    Error::InvalidRole {
        operation,
        role: "client connection".to_string(),
    }
}
