//! One established socket carrying frames.

use super::frame::{deserialize_frame, frame_ready, serialize_frame, Frame};
use crate::error::Error;
use mio::{Interest, Registry, Token};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

/// A connected socket plus its receive buffer.
///
/// The socket stays non-blocking so that it can sit in the manager's poll
/// set. Blocking receives switch it to blocking mode for the duration of a
/// single read. Polling goes through a `mio` handle cloned from the same
/// socket. Dropping the channel deregisters and shuts down the socket.
#[derive(Debug)]
pub struct SocketChannel {
    stream: TcpStream,
    recv_buf: Vec<u8>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    max_read_size: usize,
    peer_closed: bool,
    registration: Option<(Registry, Token, mio::net::TcpStream)>,
}

impl SocketChannel {
    pub fn new(stream: TcpStream, max_read_size: usize) -> Result<Self, Error> {
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        Ok(Self {
            stream,
            recv_buf: Vec::new(),
            local_addr,
            peer_addr,
            max_read_size: max_read_size.max(1),
            peer_closed: false,
            registration: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Adds the socket to a poll set under `token`.
    pub(crate) fn register(&mut self, registry: &Registry, token: Token) -> Result<(), Error> {
        // Shares the socket, so readiness follows reads on `self.stream`.
        let mut source = mio::net::TcpStream::from_std(self.stream.try_clone()?);
        registry.register(&mut source, token, Interest::READABLE)?;
        self.registration = Some((registry.try_clone()?, token, source));
        Ok(())
    }

    /// A second handle on the socket for writing frames while the channel
    /// itself is borrowed elsewhere.
    pub fn writer(&self) -> Result<FrameWriter, Error> {
        Ok(FrameWriter {
            stream: self.stream.try_clone()?,
            peer_addr: self.peer_addr,
        })
    }

    /// Writes a whole frame, blocking until it is handed to the kernel.
    #[instrument(skip(self, frame), fields(peer = %self.peer_addr, tag = frame.tag()))]
    pub fn send_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        write_frame(&mut self.stream, frame)
    }

    /// Whether a frame or a close is waiting to be handled without reading
    /// the socket again.
    pub fn needs_attention(&self) -> bool {
        self.peer_closed || frame_ready(&self.recv_buf)
    }

    /// Pulls everything the kernel has buffered into the receive buffer.
    /// Returns the number of bytes read.
    pub fn fill_nonblocking(&mut self) -> Result<usize, Error> {
        let mut total = 0;
        loop {
            let pos = self.recv_buf.len();
            self.recv_buf.resize(pos + self.max_read_size, 0);
            let result = self.stream.read(&mut self.recv_buf[pos..]);
            match result {
                Ok(0) => {
                    self.recv_buf.truncate(pos);
                    info!(local_addr = %self.local_addr, peer_addr = %self.peer_addr, "Connection closed");
                    self.peer_closed = true;
                    break;
                }
                Ok(sz) => {
                    self.recv_buf.truncate(pos + sz);
                    trace!(len = sz, peer_addr = %self.peer_addr, "Read data from socket");
                    total += sz;
                }
                Err(err) => {
                    self.recv_buf.truncate(pos);
                    match err.kind() {
                        ErrorKind::WouldBlock => break,
                        ErrorKind::Interrupted => continue,
                        _ => return Err(self.read_failed(err)),
                    }
                }
            }
        }
        if total > 0 {
            debug!(len = total, peer_addr = %self.peer_addr, "Received data");
        }
        Ok(total)
    }

    /// Takes the next complete frame without blocking, reading whatever the
    /// socket has first if the buffer holds none.
    pub fn poll_frame(&mut self) -> Result<Option<Frame>, Error> {
        if let Some(frame) = self.take_buffered()? {
            return Ok(Some(frame));
        }
        if !self.peer_closed {
            self.fill_nonblocking()?;
            if let Some(frame) = self.take_buffered()? {
                return Ok(Some(frame));
            }
        }
        if self.peer_closed {
            return Err(Error::Disconnected);
        }
        Ok(None)
    }

    /// Blocks until a complete frame arrives, the peer closes or `timeout`
    /// passes. `None` waits forever.
    #[instrument(skip(self), fields(peer = %self.peer_addr))]
    pub fn receive_frame(&mut self, timeout: Option<Duration>) -> Result<Frame, Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(frame) = self.take_buffered()? {
                return Ok(frame);
            }
            if self.peer_closed {
                return Err(Error::Disconnected);
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        warn!("Timed out waiting for frame");
                        return Err(Error::Timeout);
                    }
                    Some(remaining)
                }
                None => None,
            };
            self.read_blocking(remaining)?;
        }
    }

    fn take_buffered(&mut self) -> Result<Option<Frame>, Error> {
        match deserialize_frame(&self.recv_buf)? {
            Some((frame, len)) => {
                self.recv_buf.drain(..len);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    fn read_blocking(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        self.stream.set_nonblocking(false)?;
        // A zero read timeout is rejected by the OS.
        self.stream
            .set_read_timeout(timeout.map(|t| t.max(Duration::from_millis(1))))?;

        let pos = self.recv_buf.len();
        self.recv_buf.resize(pos + self.max_read_size, 0);
        let result = self.stream.read(&mut self.recv_buf[pos..]);

        self.stream.set_read_timeout(None)?;
        self.stream.set_nonblocking(true)?;

        match result {
            Ok(0) => {
                self.recv_buf.truncate(pos);
                info!(local_addr = %self.local_addr, peer_addr = %self.peer_addr, "Connection closed");
                self.peer_closed = true;
                Ok(())
            }
            Ok(sz) => {
                self.recv_buf.truncate(pos + sz);
                trace!(len = sz, peer_addr = %self.peer_addr, "Read data from socket");
                // Whatever else arrived with it.
                self.fill_nonblocking().map(|_| ())
            }
            Err(err) => {
                self.recv_buf.truncate(pos);
                match err.kind() {
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => Ok(()),
                    _ => Err(self.read_failed(err)),
                }
            }
        }
    }

    fn read_failed(&self, err: std::io::Error) -> Error {
        let local_addr = &self.local_addr;
        let peer_addr = &self.peer_addr;
        match err.kind() {
            ErrorKind::BrokenPipe => warn!(%local_addr, %peer_addr, "Broken pipe"),
            ErrorKind::ConnectionReset => warn!(%local_addr, %peer_addr, "Connection reset"),
            _ => error!(%local_addr, %peer_addr, ?err, "Error reading from socket"),
        }
        err.into()
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        if let Some((registry, token, mut source)) = self.registration.take() {
            if let Err(err) = registry.deregister(&mut source) {
                debug!(?err, ?token, "Failed to deregister socket");
            }
        }
        // Also ends any FrameWriter cloned from this socket.
        let _ = self.stream.shutdown(Shutdown::Both);
        debug!(local_addr = %self.local_addr, peer_addr = %self.peer_addr, "Closed socket");
    }
}

/// Write-only handle on a [`SocketChannel`]'s socket.
#[derive(Debug)]
pub struct FrameWriter {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl FrameWriter {
    pub fn send_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        trace!(peer = %self.peer_addr, tag = frame.tag(), "Sending frame through writer");
        write_frame(&mut self.stream, frame)
    }
}

fn write_frame(stream: &mut TcpStream, frame: &Frame) -> Result<(), Error> {
    let buf = serialize_frame(frame)?;
    // O_NONBLOCK lives on the shared file description, so restore it on
    // every exit path.
    stream.set_nonblocking(false)?;
    let result = stream.write_all(&buf).and_then(|_| stream.flush());
    stream.set_nonblocking(true)?;
    result?;
    trace!(len = buf.len(), "Wrote frame");
    Ok(())
}
