//! Socket link to a peer process and the handshake that sets it up.

use crate::config::ConnectionSettings;
use crate::error::Error;
use crate::ids::ProcessRole;
use crate::progress::ProgressHandler;
use crate::transport::{Frame, Reply, Request, SocketChannel, VERSION_MAJOR, VERSION_MINOR};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// One handshaken socket to a peer.
///
/// Construction runs the handshake; a value of this type is always ready
/// for requests. A failed handshake drops the socket.
#[derive(Debug)]
pub struct RemoteConnection {
    channel: SocketChannel,
    peer_role: ProcessRole,
    peer_partitions: i32,
}

impl RemoteConnection {
    /// Handshake from the connecting side: announce ourselves and wait for
    /// the peer's verdict.
    #[instrument(skip_all, fields(peer = %channel.peer_addr(), %role))]
    pub fn initiate(
        mut channel: SocketChannel,
        settings: &ConnectionSettings,
        role: ProcessRole,
    ) -> Result<Self, Error> {
        channel.send_frame(&Frame::Request(Request::Handshake {
            connect_id: settings.connect_id,
            role,
        }))?;

        let verdict = match channel.receive_frame(Some(settings.handshake_timeout)) {
            Ok(frame) => frame,
            Err(err @ (Error::VersionMismatch { .. } | Error::InvalidMagicBytes)) => {
                warn!(?err, "Peer answered in another protocol");
                return Err(Error::HandshakeRejected(err.to_string()));
            }
            Err(err) => return Err(err),
        };
        match verdict {
            Frame::Reply(Reply::Handshake {
                role: peer_role,
                number_of_partitions,
            }) => {
                if !roles_compatible(role, peer_role) {
                    warn!(%peer_role, "Peer role does not fit ours");
                    return Err(Error::HandshakeRejected(format!(
                        "{role} cannot talk to {peer_role}"
                    )));
                }
                info!(%peer_role, number_of_partitions, "Handshake accepted");
                Ok(Self {
                    channel,
                    peer_role,
                    peer_partitions: number_of_partitions,
                })
            }
            Frame::Exception(reason) => {
                warn!(%reason, "Handshake rejected by peer");
                Err(Error::HandshakeRejected(reason))
            }
            other => {
                warn!(tag = other.tag(), "Unexpected frame during handshake");
                Err(Error::UnexpectedTag(other.tag()))
            }
        }
    }

    /// Handshake from the accepting side: check the peer's announcement and
    /// answer with our role and group size.
    #[instrument(skip_all, fields(peer = %channel.peer_addr(), %role))]
    pub fn accept(
        mut channel: SocketChannel,
        settings: &ConnectionSettings,
        role: ProcessRole,
        number_of_partitions: i32,
    ) -> Result<Self, Error> {
        let announcement = match channel.receive_frame(Some(settings.handshake_timeout)) {
            Ok(frame) => frame,
            Err(err @ (Error::VersionMismatch { .. } | Error::InvalidMagicBytes)) => {
                warn!(?err, "Rejecting handshake");
                return Err(reject(&mut channel, err.to_string()));
            }
            Err(err) => return Err(err),
        };
        let (connect_id, peer_role) = match announcement {
            Frame::Request(Request::Handshake { connect_id, role }) => (connect_id, role),
            other => {
                warn!(tag = other.tag(), "Expected handshake");
                return Err(Error::UnexpectedTag(other.tag()));
            }
        };

        let rejection = if connect_id != settings.connect_id {
            Some(format!(
                "connect id {connect_id} does not match {}",
                settings.connect_id
            ))
        } else if !roles_compatible(role, peer_role) {
            Some(format!("{role} cannot talk to {peer_role}"))
        } else {
            None
        };

        if let Some(reason) = rejection {
            warn!(connect_id, %peer_role, %reason, "Rejecting handshake");
            return Err(reject(&mut channel, reason));
        }

        channel.send_frame(&Frame::Reply(Reply::Handshake {
            role,
            number_of_partitions,
        }))?;
        info!(
            %peer_role,
            protocol = %format_args!("{VERSION_MAJOR}.{VERSION_MINOR}"),
            "Handshake completed"
        );
        Ok(Self {
            channel,
            peer_role,
            peer_partitions: 0,
        })
    }

    pub fn peer_role(&self) -> ProcessRole {
        self.peer_role
    }

    /// Group size the peer reported in its handshake reply. Zero on the
    /// accepting side, which never receives one.
    pub fn peer_partitions(&self) -> i32 {
        self.peer_partitions
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.channel.peer_addr()
    }

    pub fn channel(&self) -> &SocketChannel {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut SocketChannel {
        &mut self.channel
    }

    pub fn send(&mut self, frame: &Frame) -> Result<(), Error> {
        self.channel.send_frame(frame)
    }

    /// Blocks for the reply to a request. Progress frames arriving first
    /// go to `progress`; an exception frame is the peer's failure to serve
    /// the request.
    pub fn wait_reply(
        &mut self,
        progress: &mut ProgressHandler,
        timeout: Option<Duration>,
    ) -> Result<Reply, Error> {
        loop {
            match self.channel.receive_frame(timeout)? {
                Frame::Reply(reply) => return Ok(reply),
                Frame::Progress(event) => progress.accept(event),
                Frame::Exception(message) => {
                    debug!(%message, "Peer reported an error");
                    return Err(Error::Remote(message));
                }
                Frame::Request(Request::Goodbye) => return Err(Error::Disconnected),
                Frame::Request(_) => {
                    warn!("Request arrived while waiting for a reply");
                    return Err(Error::UnexpectedTag(crate::transport::tag::RMI));
                }
            }
        }
    }
}

/// Tells the peer why its handshake failed. The peer may already be gone;
/// the rejection stands either way.
fn reject(channel: &mut SocketChannel, reason: String) -> Error {
    if let Err(err) = channel.send_frame(&Frame::Exception(reason.clone())) {
        debug!(?err, "Rejection not delivered");
    }
    Error::HandshakeRejected(reason)
}

/// A client talks to servers and servers to a client; nothing else pairs up.
fn roles_compatible(ours: ProcessRole, theirs: ProcessRole) -> bool {
    match ours {
        ProcessRole::Client => theirs.is_server(),
        role if role.is_server() => theirs == ProcessRole::Client,
        _ => false,
    }
}
