//! # NCP Link Protocol
//!
//! Core implementation of the Node Communication Protocol (NCP): the
//! length-delimited binary packet codec and the per-connection control
//! plane shared by the client and server crates.
//!
//! This crate provides:
//! - `Identifier`: four-character tags naming packets, fields and parameters
//! - `Value`, `Params`, `FieldData`, `Packet`: the wire data model and codec
//! - `PacketReader` / `write_packet`: streaming packet I/O
//! - `Connection`: send/receive, demultiplexing, keepalive and auto-filters
//! - `Response`: per-request reply streams correlated by field id
//! - `handshake`: the `LINK` vocabulary and authentication handshake
//! - Error types for framing, transport and command faults
//!
//! ## Example
//!
//! ```no_run
//! use ncplink_protocol::{Connection, ConnectionOptions, Params, Value};
//!
//! # async fn demo() -> Result<(), ncplink_protocol::NcpError> {
//! // Any bidirectional byte stream works; a real client dials TCP.
//! let (stream, _peer) = tokio::io::duplex(4096);
//! let connection = Connection::new(stream, ConnectionOptions::default());
//!
//! let mut params = Params::new();
//! params.insert("SAMP".parse()?, 1024i32);
//! let mut response = connection.send("DSPC", "TIME", params).await?;
//!
//! if let Some(field) = response.recv().await? {
//!     if let Some(Value::I32(count)) = field.get("TSDC") {
//!         println!("sweep count: {count}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod field;
pub mod handshake;
pub mod identifier;
pub mod options;
pub mod packet;
pub mod response;
pub mod stream;
pub mod value;

pub use connection::{Connection, Field, HandshakeState};
pub use error::{
    CommandError, CommandWarning, FrameError, FrameResult, NcpError, NetworkError, Result,
};
pub use field::{FieldData, Params, FIELD_FOOTER_SIZE, FIELD_HEADER_SIZE};
pub use identifier::Identifier;
pub use options::ConnectionOptions;
pub use packet::{
    decode_packet, encode_packet, Packet, Timestamp, PACKET_FOOTER_SIZE, PACKET_HEADER_SIZE,
};
pub use response::Response;
pub use stream::{write_packet, PacketReader};
pub use value::{Value, PARAM_HEADER_SIZE};
