//! Socket transport.
//!
//! Frames travel over plain TCP. [`ServerSocket`] accepts, [`connect_with_retry`]
//! connects and [`SocketChannel`] moves [`Frame`]s over an established socket.
//! Nothing in here knows about connections; the
//! [`ConnectionManager`](crate::ConnectionManager) decides what a socket is for.

mod channel;
mod frame;
mod tcp;

pub use channel::{FrameWriter, SocketChannel};
pub use frame::{deserialize_frame, serialize_frame, tag, Frame, Reply, Request};
pub(crate) use frame::{VERSION_MAJOR, VERSION_MINOR};
pub use tcp::{connect_with_retry, ServerSocket};
