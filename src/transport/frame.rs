use crate::codec;
use crate::error::Error;
use crate::ids::{ObjectHandle, ProcessRole};
use crate::progress::ProgressEvent;
use bincode::{Decode, Encode};
use tracing::{error, trace};

// ============================================================================
// Constants
// ============================================================================

const MAGIC: &[u8] = b"pmc!";
const MAGIC_SIZE: usize = MAGIC.len();
pub(crate) const VERSION_MAJOR: u8 = 1;
pub(crate) const VERSION_MINOR: u8 = 0;
const VERSION_SIZE: usize = 2; // major + minor
const TAG_SIZE: usize = 1;
const BODY_SIZE_SIZE: usize = 4;
const HEADER_SIZE: usize = MAGIC_SIZE + VERSION_SIZE + TAG_SIZE + BODY_SIZE_SIZE;

/// Frame tags. The receiver looks at the tag before it decodes the body.
pub mod tag {
    pub const RMI: u8 = 1;
    pub const REPLY: u8 = 2;
    pub const PROGRESS: u8 = 3;
    pub const EXCEPTION: u8 = 4;
}

// ============================================================================
// Messages
// ============================================================================

/// Requests sent by the side that drives the session.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Request {
    /// First frame on every socket, sent by the connecting side.
    Handshake { connect_id: i32, role: ProcessRole },
    /// Execute a command stream. No reply.
    Stream { servers: u32, data: Vec<u8> },
    Gather {
        servers: u32,
        info_tag: String,
        handle: ObjectHandle,
    },
    LastResult { servers: u32 },
    LoadModule {
        servers: u32,
        name: String,
        directory: String,
    },
    /// Open the progress window on the serving side. No reply.
    PrepareProgress,
    /// Close the progress window; answered by [`Reply::ProgressCleaned`].
    CleanupProgress,
    /// Store an undo step. No reply.
    UndoPush { label: String, xml: String },
    UndoPull { redo: bool },
    /// The sender is closing the connection.
    Goodbye,
}

/// Answers to [`Request`]s.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Reply {
    Handshake {
        role: ProcessRole,
        number_of_partitions: i32,
    },
    Information { data: Vec<u8> },
    LastResult { data: Vec<u8> },
    ModuleLoaded { ok: bool },
    ProgressCleaned,
    Undo { xml: Option<String> },
}

/// A unit on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(Request),
    Reply(Reply),
    Progress(ProgressEvent),
    /// The peer failed to serve a request.
    Exception(String),
}

impl Frame {
    pub fn tag(&self) -> u8 {
        match self {
            Frame::Request(_) => tag::RMI,
            Frame::Reply(_) => tag::REPLY,
            Frame::Progress(_) => tag::PROGRESS,
            Frame::Exception(_) => tag::EXCEPTION,
        }
    }
}

// ============================================================================
// Frame Serialization and Deserialization
// ============================================================================

/// Serializes a frame to its wire format.
///
/// Wire format: \[MAGIC\]\[VERSION\]\[tag\]\[body_size\]\[body\]
/// - MAGIC: 4 bytes ("pmc!") - helps detect protocol mismatches
/// - VERSION: 2 bytes (major, minor) - protocol version
/// - tag: 1 byte - kind of frame, see [`tag`]
/// - body_size: 4 bytes (u32 LE) - length of the body
/// - body: bincode encoding of the frame's payload
pub fn serialize_frame(frame: &Frame) -> Result<Vec<u8>, Error> {
    let body = match frame {
        Frame::Request(request) => codec::encode(request)?,
        Frame::Reply(reply) => codec::encode(reply)?,
        Frame::Progress(event) => codec::encode(event)?,
        Frame::Exception(message) => codec::encode(message)?,
    };
    let body_len = u32::try_from(body.len())
        .map_err(|_| Error::MalformedData(format!("frame body of {} bytes", body.len())))?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(MAGIC);
    buf.push(VERSION_MAJOR);
    buf.push(VERSION_MINOR);
    buf.push(frame.tag());
    buf.extend(&body_len.to_le_bytes());
    buf.extend(body);

    trace!(tag = frame.tag(), len = buf.len(), "Serialized frame");
    Ok(buf)
}

/// Deserializes one frame from the front of `buf`.
///
/// Returns:
/// - `Ok(Some((frame, bytes_read)))` - a complete frame
/// - `Ok(None)` - not enough data yet
/// - `Err(_)` - bad magic, version mismatch, unknown tag or malformed body
pub fn deserialize_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, Error> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    if &buf[0..MAGIC_SIZE] != MAGIC {
        error!(
            expected = ?MAGIC,
            received = ?&buf[0..MAGIC_SIZE],
            "Invalid magic bytes in frame header"
        );
        return Err(Error::InvalidMagicBytes);
    }

    let version_major = buf[MAGIC_SIZE];
    let version_minor = buf[MAGIC_SIZE + 1];
    if version_major != VERSION_MAJOR || version_minor != VERSION_MINOR {
        error!(
            expected_major = VERSION_MAJOR,
            expected_minor = VERSION_MINOR,
            received_major = version_major,
            received_minor = version_minor,
            "Protocol version mismatch"
        );
        return Err(Error::VersionMismatch {
            expected_major: VERSION_MAJOR,
            expected_minor: VERSION_MINOR,
            received_major: version_major,
            received_minor: version_minor,
        });
    }

    let frame_tag = buf[MAGIC_SIZE + VERSION_SIZE];
    if !(tag::RMI..=tag::EXCEPTION).contains(&frame_tag) {
        error!(tag = frame_tag, "Unknown frame tag");
        return Err(Error::UnexpectedTag(frame_tag));
    }

    let size_pos = MAGIC_SIZE + VERSION_SIZE + TAG_SIZE;
    let mut body_size_bytes = [0u8; BODY_SIZE_SIZE];
    body_size_bytes.copy_from_slice(&buf[size_pos..size_pos + BODY_SIZE_SIZE]);
    let frame_size = HEADER_SIZE + u32::from_le_bytes(body_size_bytes) as usize;

    if buf.len() < frame_size {
        return Ok(None); // Wait for more data
    }

    let body = &buf[HEADER_SIZE..frame_size];
    let frame = match frame_tag {
        tag::RMI => Frame::Request(codec::decode(body)?),
        tag::REPLY => Frame::Reply(codec::decode(body)?),
        tag::PROGRESS => Frame::Progress(codec::decode(body)?),
        _ => Frame::Exception(codec::decode(body)?),
    };

    trace!(tag = frame_tag, len = frame_size, "Deserialized frame");
    Ok(Some((frame, frame_size)))
}

/// Whether `buf` starts with a complete frame. Only the header length field
/// is looked at; the frame may still fail to deserialize.
pub(crate) fn frame_ready(buf: &[u8]) -> bool {
    if buf.len() < HEADER_SIZE {
        return false;
    }
    let size_pos = MAGIC_SIZE + VERSION_SIZE + TAG_SIZE;
    let mut body_size_bytes = [0u8; BODY_SIZE_SIZE];
    body_size_bytes.copy_from_slice(&buf[size_pos..size_pos + BODY_SIZE_SIZE]);
    buf.len() >= HEADER_SIZE + u32::from_le_bytes(body_size_bytes) as usize
}
