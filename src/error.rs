use thiserror::Error;

/// The error type for pmconnect operations.
///
/// Transport and handshake failures are normally absorbed by the
/// [`ConnectionManager`](crate::ConnectionManager), which tears the affected
/// connection down and reports it through its return status and
/// [`ConnectionEvent`](crate::ConnectionEvent)s. Errors that reach the caller
/// describe the operation that failed at the API boundary.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================
    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided host and port could not be resolved.
    #[error("Invalid socket address {host}:{port}")]
    InvalidAddress { host: String, port: u16 },

    /// Attempted to operate on a connection ID that doesn't exist.
    #[error("Connection {id} not found")]
    ConnectionNotFound {
        /// The connection ID that was not found.
        id: u32,
    },

    /// Attempted to operate on a listener handle that doesn't exist.
    #[error("Listener {handle} not found")]
    ListenerNotFound {
        /// The listener handle that was not found.
        handle: usize,
    },

    /// The readiness poll itself failed.
    #[error("Poll error: {0}")]
    PollError(String),

    /// Outbound connection attempts did not succeed within the retry window.
    #[error("Could not connect to {host}:{port} within {elapsed_ms} ms")]
    ConnectTimeout {
        host: String,
        port: u16,
        elapsed_ms: u128,
    },

    /// The peer closed the connection.
    #[error("Peer disconnected")]
    Disconnected,

    /// A blocking receive did not complete in time.
    #[error("Timed out waiting for peer")]
    Timeout,

    // ============================================================================
    // Wire Protocol Errors
    // ============================================================================
    /// Frame header doesn't start with the expected magic bytes.
    #[error("Invalid magic bytes in frame header")]
    InvalidMagicBytes,

    /// Frame protocol version is incompatible with this library version.
    #[error("Protocol version mismatch: expected {expected_major}.{expected_minor}, but peer uses {received_major}.{received_minor}")]
    VersionMismatch {
        expected_major: u8,
        expected_minor: u8,
        received_major: u8,
        received_minor: u8,
    },

    /// A frame arrived with a tag this side does not understand, or in a
    /// place where that tag is not allowed.
    #[error("Unexpected frame tag {0}")]
    UnexpectedTag(u8),

    /// Frame or payload data is corrupted or doesn't match the expected format.
    #[error("Malformed data: {0}")]
    MalformedData(String),

    /// The peer refused the handshake.
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The peer reported an error while serving a request.
    #[error("Remote error: {0}")]
    Remote(String),

    // ============================================================================
    // Process Group Errors
    // ============================================================================
    /// A send, receive or broadcast on the process controller failed.
    #[error("Controller error: {0}")]
    Controller(String),

    // ============================================================================
    // Interpreter Errors
    // ============================================================================
    /// No constructor is registered for the requested class.
    #[error("Unknown class '{0}'")]
    UnknownClass(String),

    /// No object is bound to the handle.
    #[error("No object bound to handle {0}")]
    UnknownObject(u64),

    /// A handle is already bound to a live object.
    #[error("Handle {0} is already in use")]
    HandleInUse(u64),

    /// The target object does not implement the method.
    #[error("Object of class '{class}' has no method '{method}'")]
    UnknownMethod { class: String, method: String },

    /// A method received arguments it cannot use.
    #[error("Bad arguments for '{method}': {reason}")]
    BadArguments { method: String, reason: String },

    /// No constructor is registered for the information type.
    #[error("Unknown information type '{0}'")]
    UnknownInformation(String),

    /// No extension module is registered under this name.
    #[error("Unknown module '{0}'")]
    UnknownModule(String),

    // ============================================================================
    // Lifecycle Errors
    // ============================================================================
    /// The manager has not been initialized yet.
    #[error("Connection manager is not initialized")]
    NotInitialized,

    /// `initialize()` was called twice.
    #[error("Connection manager is already initialized")]
    AlreadyInitialized,

    /// The operation is not available for the process role.
    #[error("Operation '{operation}' is not available for role {role}")]
    InvalidRole {
        operation: &'static str,
        role: String,
    },

    /// The connection was aborted after a transport or protocol failure.
    #[error("Connection {id} is aborted")]
    Aborted { id: u32 },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Whether the error means the underlying socket is no longer usable.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Disconnected
                | Error::Timeout
                | Error::InvalidMagicBytes
                | Error::VersionMismatch { .. }
                | Error::UnexpectedTag(_)
                | Error::MalformedData(_)
        )
    }
}
