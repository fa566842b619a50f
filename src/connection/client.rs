//! Server-side view of the attached client.

use super::remote::RemoteConnection;
use crate::error::Error;
use crate::ids::{ConnectionId, ProcessRole, ServerFlags};
use crate::progress::ProgressHandler;
use crate::stream::CommandStream;
use crate::transport::{Frame, FrameWriter, Reply, Request, SocketChannel};
use crate::undo::UndoRedoStore;
use tracing::{debug, info, instrument, trace, warn};

/// Connection from a server process back to its client.
///
/// Requests from the client come in through
/// [`process_communication`](Self::process_communication); the ones that
/// need the local process group are handed to the manager, which executes
/// them and answers through [`reply`](Self::reply).
#[derive(Debug)]
pub struct ClientConnection {
    id: ConnectionId,
    link: RemoteConnection,
    undo: Box<dyn UndoRedoStore>,
    progress: ProgressHandler,
    aborted: bool,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, link: RemoteConnection, undo: Box<dyn UndoRedoStore>) -> Self {
        info!(%id, client = %link.peer_addr(), "Client connection created");
        Self {
            id,
            link,
            undo,
            progress: ProgressHandler::detached(),
            aborted: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_role(&self) -> ProcessRole {
        self.link.peer_role()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub(crate) fn abort(&mut self) {
        self.aborted = true;
    }

    /// Progress never arrives from a client, so this handler stays detached.
    pub fn progress_handler(&self) -> &ProgressHandler {
        &self.progress
    }

    pub fn progress_handler_mut(&mut self) -> &mut ProgressHandler {
        &mut self.progress
    }

    pub fn undo_store(&self) -> &dyn UndoRedoStore {
        self.undo.as_ref()
    }

    pub(crate) fn sockets_mut(&mut self) -> impl Iterator<Item = &mut SocketChannel> {
        std::iter::once(self.link.channel_mut())
    }

    pub(crate) fn needs_attention(&self) -> bool {
        self.link.channel().needs_attention()
    }

    /// Writer used to stream progress to the client while a request runs.
    pub(crate) fn progress_writer(&self) -> Result<FrameWriter, Error> {
        self.link.channel().writer()
    }

    fn track<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(err) = &result {
            if err.is_fatal_to_connection() {
                warn!(id = %self.id, ?err, "Aborting client connection");
                self.aborted = true;
            }
        }
        result
    }

    /// Streams go from the client to the servers, never back. Anything sent
    /// here is dropped.
    pub fn send_stream(&mut self, flags: ServerFlags, stream: &CommandStream) -> Result<(), Error> {
        debug!(id = %self.id, ?flags, len = stream.len(), "Ignoring stream addressed to client");
        Ok(())
    }

    /// Handles one frame from the client.
    ///
    /// Returns the request if the local process group has to serve it.
    /// Undo requests are served right here. An error means the connection
    /// is finished: the client left, broke the protocol or the socket failed.
    #[instrument(skip(self), fields(id = %self.id))]
    pub fn process_communication(&mut self) -> Result<Option<Request>, Error> {
        let polled = self.link.channel_mut().poll_frame();
        let frame = match self.track(polled)? {
            Some(frame) => frame,
            None => return Ok(None),
        };

        match frame {
            Frame::Request(Request::Goodbye) => {
                info!("Client said goodbye");
                self.aborted = true;
                Err(Error::Disconnected)
            }
            Frame::Request(Request::Handshake { .. }) => {
                warn!("Repeated handshake");
                self.aborted = true;
                Err(Error::UnexpectedTag(crate::transport::tag::RMI))
            }
            Frame::Request(Request::UndoPush { label, xml }) => {
                trace!(%label, "Storing undo step");
                self.undo.push(label, xml);
                Ok(None)
            }
            Frame::Request(Request::UndoPull { redo }) => {
                let xml = if redo {
                    self.undo.redo()
                } else {
                    self.undo.undo()
                };
                self.reply(Reply::Undo { xml })?;
                Ok(None)
            }
            Frame::Request(request) => Ok(Some(request)),
            other => {
                warn!(tag = other.tag(), "Unexpected frame from client");
                self.aborted = true;
                Err(Error::UnexpectedTag(other.tag()))
            }
        }
    }

    pub fn reply(&mut self, reply: Reply) -> Result<(), Error> {
        let result = self.link.send(&Frame::Reply(reply));
        self.track(result)
    }

    /// Tells the client its request failed.
    pub fn send_exception(&mut self, message: &str) -> Result<(), Error> {
        let result = self.link.send(&Frame::Exception(message.to_string()));
        self.track(result)
    }

    #[instrument(skip(self), fields(id = %self.id))]
    pub fn finalize(&mut self) {
        if self.aborted {
            return;
        }
        if let Err(err) = self.link.send(&Frame::Request(Request::Goodbye)) {
            debug!(?err, "Goodbye not delivered");
        }
        self.aborted = true;
    }
}
