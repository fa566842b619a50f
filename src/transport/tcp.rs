//! TCP listening sockets and outbound connects.

use crate::error::Error;
use crate::ids::ServerSocketType;
use mio::{Interest, Registry, Token};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// A listening socket tagged with the kind of peer it expects.
#[derive(Debug)]
pub struct ServerSocket {
    listener: TcpListener,
    socket_type: ServerSocketType,
    local_addr: SocketAddr,
    registration: Option<(Registry, Token, mio::net::TcpListener)>,
}

impl ServerSocket {
    /// Binds on all interfaces. Port 0 picks a free port.
    #[instrument]
    pub fn bind(port: u16, socket_type: ServerSocketType) -> Result<Self, Error> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, ?socket_type, "Listening for connections");
        Ok(Self {
            listener,
            socket_type,
            local_addr,
            registration: None,
        })
    }

    pub fn socket_type(&self) -> ServerSocketType {
        self.socket_type
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn register(&mut self, registry: &Registry, token: Token) -> Result<(), Error> {
        let mut source = mio::net::TcpListener::from_std(self.listener.try_clone()?);
        registry.register(&mut source, token, Interest::READABLE)?;
        self.registration = Some((registry.try_clone()?, token, source));
        Ok(())
    }

    /// Accepts every connection that is waiting.
    pub fn accept_pending(&mut self) -> Result<Vec<TcpStream>, Error> {
        let local_addr = &self.local_addr;
        let mut new_streams = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    info!(%local_addr, %peer_addr, "Accepting connection");
                    new_streams.push(stream);
                }
                Err(err) => match err.kind() {
                    // Further accepting would block, so we are done
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        warn!(?err, %local_addr, "Transient accept error");
                        continue;
                    }
                    _ => {
                        error!(?err, %local_addr, "Error accepting connection");
                        return Err(err.into());
                    }
                },
            }
        }
        Ok(new_streams)
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        if let Some((registry, _, mut source)) = self.registration.take() {
            if let Err(err) = registry.deregister(&mut source) {
                debug!(?err, "Failed to deregister listener");
            }
        }
        info!(local_addr = %self.local_addr, "Closed listener");
    }
}

/// Connects to `host:port`, retrying every `interval` until `timeout` has
/// passed since the first attempt.
#[instrument]
pub fn connect_with_retry(
    host: &str,
    port: u16,
    timeout: Duration,
    interval: Duration,
) -> Result<TcpStream, Error> {
    let start = Instant::now();
    let deadline = start + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match try_connect(host, port, deadline) {
            Ok(stream) => {
                info!(attempts, peer_addr = ?stream.peer_addr().ok(), "Connected");
                return Ok(stream);
            }
            Err(err) => debug!(attempts, ?err, "Connect attempt failed"),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            let elapsed_ms = start.elapsed().as_millis();
            warn!(attempts, elapsed_ms, "Giving up connecting");
            return Err(Error::ConnectTimeout {
                host: host.to_string(),
                port,
                elapsed_ms,
            });
        }
        thread::sleep(interval.min(remaining));
    }
}

fn try_connect(host: &str, port: u16, deadline: Instant) -> Result<TcpStream, Error> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| Error::InvalidAddress {
            host: host.to_string(),
            port,
        })?
        .collect();

    let mut last_err = Error::InvalidAddress {
        host: host.to_string(),
        port,
    };
    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match TcpStream::connect_timeout(&addr, remaining) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = err.into(),
        }
    }
    Err(last_err)
}
