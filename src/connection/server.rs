//! Client-side view of a data server and, optionally, a separate render
//! server.

use super::remote::RemoteConnection;
use crate::config::ConnectionSettings;
use crate::error::Error;
use crate::ids::{ConnectionId, GroupScope, ObjectHandle, ServerFlags};
use crate::information::Information;
use crate::progress::ProgressHandler;
use crate::stream::CommandStream;
use crate::transport::{Frame, Reply, Request, SocketChannel};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Which socket a request goes to, and with which flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendPlan {
    pub data: Option<ServerFlags>,
    pub render: Option<ServerFlags>,
}

impl SendPlan {
    pub fn is_empty(&self) -> bool {
        self.data.is_none() && self.render.is_none()
    }
}

/// Which of the two sockets an inbound frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Data,
    Render,
}

/// Connection from a client to its server processes.
#[derive(Debug)]
pub struct ServerConnection {
    id: ConnectionId,
    data: RemoteConnection,
    render: Option<RemoteConnection>,
    progress: ProgressHandler,
    receive_timeout: Option<Duration>,
    aborted: bool,
}

impl ServerConnection {
    pub fn new(
        id: ConnectionId,
        data: RemoteConnection,
        render: Option<RemoteConnection>,
        settings: &ConnectionSettings,
    ) -> Self {
        info!(
            %id,
            data = %data.peer_addr(),
            render = ?render.as_ref().map(|r| r.peer_addr()),
            "Server connection created"
        );
        Self {
            id,
            data,
            render,
            progress: ProgressHandler::new(settings.progress_frequency),
            receive_timeout: settings.receive_timeout,
            aborted: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub(crate) fn abort(&mut self) {
        self.aborted = true;
    }

    /// Whether render traffic has its own socket.
    pub fn has_render_server_channel(&self) -> bool {
        self.render.is_some()
    }

    /// Size of the data-server process group.
    pub fn number_of_data_partitions(&self) -> i32 {
        self.data.peer_partitions()
    }

    /// Size of the render-server process group, if it is separate.
    pub fn number_of_render_partitions(&self) -> Option<i32> {
        self.render.as_ref().map(|r| r.peer_partitions())
    }

    pub fn progress_handler(&self) -> &ProgressHandler {
        &self.progress
    }

    pub fn progress_handler_mut(&mut self) -> &mut ProgressHandler {
        &mut self.progress
    }

    pub(crate) fn sockets_mut(&mut self) -> impl Iterator<Item = &mut SocketChannel> {
        std::iter::once(self.data.channel_mut())
            .chain(self.render.as_mut().map(|r| r.channel_mut()))
    }

    pub(crate) fn needs_attention(&self) -> bool {
        self.data.channel().needs_attention()
            || self
                .render
                .as_ref()
                .is_some_and(|r| r.channel().needs_attention())
    }

    fn remote_mut(&mut self, channel: Channel) -> Option<&mut RemoteConnection> {
        match channel {
            Channel::Data => Some(&mut self.data),
            Channel::Render => self.render.as_mut(),
        }
    }

    /// Splits `flags` over the data and render sockets. Root and all forms
    /// of one group collapse into the all form. Without a render socket the
    /// data socket reaches both groups.
    pub fn create_send_flag(&self, flags: ServerFlags) -> SendPlan {
        let to_flags = |scope, all, root| match scope {
            GroupScope::All => all,
            GroupScope::Root => root,
        };
        if self.render.is_some() {
            SendPlan {
                data: flags.data_scope().map(|s| {
                    to_flags(s, ServerFlags::DATA_SERVER, ServerFlags::DATA_SERVER_ROOT)
                }),
                render: flags.render_scope().map(|s| {
                    to_flags(s, ServerFlags::RENDER_SERVER, ServerFlags::RENDER_SERVER_ROOT)
                }),
            }
        } else {
            SendPlan {
                data: flags.server_scope().map(|s| {
                    to_flags(s, ServerFlags::DATA_SERVER, ServerFlags::DATA_SERVER_ROOT)
                }),
                render: None,
            }
        }
    }

    fn ensure_usable(&self) -> Result<(), Error> {
        if self.aborted {
            return Err(Error::Aborted { id: self.id.raw() });
        }
        Ok(())
    }

    /// Marks the connection aborted when `result` says the socket is gone.
    fn track<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(err) = &result {
            if err.is_fatal_to_connection() {
                warn!(id = %self.id, ?err, "Aborting server connection");
                self.aborted = true;
            }
        }
        result
    }

    fn send_on(&mut self, channel: Channel, frame: &Frame) -> Result<(), Error> {
        let id = self.id.raw();
        let remote = self
            .remote_mut(channel)
            .ok_or(Error::ConnectionNotFound { id })?;
        let result = remote.send(frame);
        self.track(result)
    }

    fn request(&mut self, channel: Channel, request: Request) -> Result<Reply, Error> {
        self.ensure_usable()?;
        self.send_on(channel, &Frame::Request(request))?;
        let timeout = self.receive_timeout;
        let id = self.id.raw();
        let Self {
            data,
            render,
            progress,
            ..
        } = &mut *self;
        let remote = match channel {
            Channel::Data => data,
            Channel::Render => render.as_mut().ok_or(Error::ConnectionNotFound { id })?,
        };
        let result = remote.wait_reply(progress, timeout);
        self.track(result)
    }

    /// Channel serving requests aimed at `flags`: render if a render bit is
    /// set and a render socket exists, data otherwise.
    fn channel_for(&self, flags: ServerFlags) -> Channel {
        if flags.wants_render_server() && self.render.is_some() {
            Channel::Render
        } else {
            Channel::Data
        }
    }

    #[instrument(skip(self, stream), fields(id = %self.id, len = stream.len()))]
    pub fn send_stream(&mut self, flags: ServerFlags, stream: &CommandStream) -> Result<(), Error> {
        self.ensure_usable()?;
        let plan = self.create_send_flag(flags);
        if plan.is_empty() {
            debug!(?flags, "No server addressed");
            return Ok(());
        }
        let data = stream.data()?;
        if let Some(servers) = plan.data {
            debug!(?servers, "Sending stream to data server");
            self.send_on(
                Channel::Data,
                &Frame::Request(Request::Stream {
                    servers: servers.bits(),
                    data: data.clone(),
                }),
            )?;
        }
        if let Some(servers) = plan.render {
            debug!(?servers, "Sending stream to render server");
            self.send_on(
                Channel::Render,
                &Frame::Request(Request::Stream {
                    servers: servers.bits(),
                    data,
                }),
            )?;
        }
        Ok(())
    }

    #[instrument(skip(self, info), fields(id = %self.id, info = info.type_tag(), %handle))]
    pub fn gather_information(
        &mut self,
        flags: ServerFlags,
        info: &mut dyn Information,
        handle: ObjectHandle,
    ) -> Result<(), Error> {
        let channel = self.channel_for(flags);
        let reply = self.request(
            channel,
            Request::Gather {
                servers: flags.bits(),
                info_tag: info.type_tag().to_string(),
                handle,
            },
        )?;
        match reply {
            Reply::Information { data } => info.copy_from_stream(&data),
            other => Err(self.unexpected(other)),
        }
    }

    #[instrument(skip(self), fields(id = %self.id))]
    pub fn last_result(&mut self, flags: ServerFlags) -> Result<CommandStream, Error> {
        let channel = self.channel_for(flags);
        match self.request(
            channel,
            Request::LastResult {
                servers: flags.bits(),
            },
        )? {
            Reply::LastResult { data } => CommandStream::from_data(&data),
            other => Err(self.unexpected(other)),
        }
    }

    /// Loads the module on the data server and, if separate, the render
    /// server.
    #[instrument(skip(self), fields(id = %self.id))]
    pub fn load_module(&mut self, name: &str, directory: &str) -> Result<(), Error> {
        let channels: &[Channel] = if self.render.is_some() {
            &[Channel::Data, Channel::Render]
        } else {
            &[Channel::Data]
        };
        for &channel in channels {
            let reply = self.request(
                channel,
                Request::LoadModule {
                    servers: ServerFlags::SERVERS.bits(),
                    name: name.to_string(),
                    directory: directory.to_string(),
                },
            )?;
            match reply {
                Reply::ModuleLoaded { ok: true } => {}
                Reply::ModuleLoaded { ok: false } => {
                    return Err(Error::Remote(format!(
                        "{channel:?} server failed to load module '{name}'"
                    )))
                }
                other => return Err(self.unexpected(other)),
            }
        }
        Ok(())
    }

    /// Stores an undo step on the data server.
    pub fn push_undo(&mut self, label: &str, xml: &str) -> Result<(), Error> {
        self.ensure_usable()?;
        self.send_on(
            Channel::Data,
            &Frame::Request(Request::UndoPush {
                label: label.to_string(),
                xml: xml.to_string(),
            }),
        )
    }

    /// Steps the data server's undo stack back (or forward with `redo`).
    pub fn pull_undo(&mut self, redo: bool) -> Result<Option<String>, Error> {
        match self.request(Channel::Data, Request::UndoPull { redo })? {
            Reply::Undo { xml } => Ok(xml),
            other => Err(self.unexpected(other)),
        }
    }

    /// Opens the progress window here and on the servers.
    pub fn prepare_progress(&mut self) -> Result<(), Error> {
        self.ensure_usable()?;
        self.progress.prepare_progress();
        self.send_on(Channel::Data, &Frame::Request(Request::PrepareProgress))?;
        if self.render.is_some() {
            self.send_on(Channel::Render, &Frame::Request(Request::PrepareProgress))?;
        }
        Ok(())
    }

    /// Closes the progress window, then waits for each server to confirm
    /// that it stopped sending. Progress still in flight is discarded.
    pub fn cleanup_pending_progress(&mut self) -> Result<(), Error> {
        self.progress.cleanup_pending_progress();
        let channels: &[Channel] = if self.render.is_some() {
            &[Channel::Data, Channel::Render]
        } else {
            &[Channel::Data]
        };
        for &channel in channels {
            match self.request(channel, Request::CleanupProgress)? {
                Reply::ProgressCleaned => {}
                other => return Err(self.unexpected(other)),
            }
        }
        Ok(())
    }

    /// Handles one unsolicited frame from the servers. Only progress is
    /// expected outside a request.
    pub(crate) fn process_communication(&mut self) -> Result<(), Error> {
        for channel in [Channel::Data, Channel::Render] {
            let Some(remote) = self.remote_mut(channel) else {
                continue;
            };
            let polled = remote.channel_mut().poll_frame();
            let frame = match self.track(polled)? {
                Some(frame) => frame,
                None => continue,
            };
            return self.handle_unsolicited(channel, frame);
        }
        Ok(())
    }

    fn handle_unsolicited(&mut self, channel: Channel, frame: Frame) -> Result<(), Error> {
        match frame {
            Frame::Progress(event) => {
                self.progress.accept(event);
                Ok(())
            }
            Frame::Exception(message) => {
                warn!(id = %self.id, ?channel, %message, "Server reported an error");
                Ok(())
            }
            Frame::Request(Request::Goodbye) => {
                info!(id = %self.id, ?channel, "Server said goodbye");
                self.aborted = true;
                Err(Error::Disconnected)
            }
            other => {
                warn!(id = %self.id, ?channel, tag = other.tag(), "Unexpected frame from server");
                self.aborted = true;
                Err(Error::UnexpectedTag(other.tag()))
            }
        }
    }

    fn unexpected(&mut self, reply: Reply) -> Error {
        warn!(id = %self.id, ?reply, "Reply does not match request");
        self.aborted = true;
        Error::UnexpectedTag(crate::transport::tag::REPLY)
    }

    /// Says goodbye on every socket that is still usable.
    #[instrument(skip(self), fields(id = %self.id))]
    pub fn finalize(&mut self) {
        if self.aborted {
            return;
        }
        for channel in [Channel::Data, Channel::Render] {
            if let Some(remote) = self.remote_mut(channel) {
                if let Err(err) = remote.send(&Frame::Request(Request::Goodbye)) {
                    debug!(?channel, ?err, "Goodbye not delivered");
                }
            }
        }
        self.aborted = true;
    }
}
