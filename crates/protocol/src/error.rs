use crate::identifier::Identifier;
use thiserror::Error;

/// Faults detected while encoding or decoding the wire format.
///
/// Any of these observed on an inbound stream means the framing has
/// desynchronized; the connection cannot recover and is closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),

    #[error("malformed value: {0}")]
    MalformedValue(String),

    #[error("malformed field: {0}")]
    MalformedField(String),

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("unexpected end of stream")]
    UnexpectedEof,
}

/// Result type for codec operations
pub type FrameResult<T> = std::result::Result<T, FrameError>;

/// Transport-level faults: I/O failure or framing desynchronization.
///
/// I/O errors are carried as display strings so the fault can be fanned out
/// to every consumer queue on the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("i/o error: {0}")]
    Io(String),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        NetworkError::Io(err.to_string())
    }
}

/// An `ERRO` parameter converted to an error at the consumer that owns the
/// matching field id.
///
/// Command errors are local to one request; the connection remains usable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{packet_type} {field_name} {detail:?} (code {code})")]
pub struct CommandError {
    /// Type of the packet that carried the `ERRO` parameter.
    pub packet_type: Identifier,

    /// Name of the field that carried the `ERRO` parameter.
    pub field_name: Identifier,

    /// Human-readable message from the peer.
    pub detail: String,

    /// Non-zero `ERRC` code from the peer.
    pub code: i32,
}

/// A `WARN` parameter delivered through the warning sink; never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandWarning {
    /// Type of the packet that carried the `WARN` parameter.
    pub packet_type: Identifier,

    /// Name of the field that carried the `WARN` parameter.
    pub field_name: Identifier,

    /// Human-readable message from the peer.
    pub detail: String,

    /// `WARC` code from the peer, zero when absent.
    pub code: i32,
}

impl std::fmt::Display for CommandWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {:?} (code {})",
            self.packet_type, self.field_name, self.detail, self.code
        )
    }
}

/// Connection-level error taxonomy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NcpError {
    /// Transport closed unexpectedly, I/O failed, or framing desynchronized.
    /// Fatal to the connection.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// The authentication handshake failed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The peer rejected a command. Not fatal to the connection.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// The connection was closed by the peer, or is otherwise unusable.
    ///
    /// A caller-initiated close is not an error: receive calls report it as
    /// a clean `Ok(None)` end-of-stream, and only sends and replies issued
    /// after the close see this variant.
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<FrameError> for NcpError {
    fn from(err: FrameError) -> Self {
        NcpError::Network(NetworkError::Frame(err))
    }
}

impl From<std::io::Error> for NcpError {
    fn from(err: std::io::Error) -> Self {
        NcpError::Network(NetworkError::from(err))
    }
}

/// Result type for connection-level operations
pub type Result<T> = std::result::Result<T, NcpError>;
