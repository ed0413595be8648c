//! Typed parameter values and their wire codec.
//!
//! Each parameter on the wire is an 8-byte header followed by a padded
//! payload:
//!
//! ```text
//! ┌───────────────┬──────────┬──────────────────────────────────────────┐
//! │ name          │ 4 bytes  │ identifier                               │
//! ├───────────────┼──────────┼──────────────────────────────────────────┤
//! │ size/type     │ 4 bytes  │ LE u32: low 24 bits = size in 4-byte     │
//! │               │          │ words (header included), high 8 = tag    │
//! ├───────────────┼──────────┼──────────────────────────────────────────┤
//! │ payload       │ N bytes  │ zero-padded to a 4-byte boundary         │
//! └───────────────┴──────────┴──────────────────────────────────────────┘
//! ```
//!
//! Padding bytes must be zero on encode and are not checked on decode.
//! Array and raw payload lengths are word-granular: the decoder hands back
//! everything after the header, so narrow arrays whose byte length is not a
//! multiple of four gain trailing zero elements on a round trip.

use crate::error::{FrameError, FrameResult};
use crate::identifier::Identifier;
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the parameter header in bytes
pub const PARAM_HEADER_SIZE: usize = 8;

// Known type tags.

const TYPE_I32: u8 = 0x00;
const TYPE_U32: u8 = 0x01;
const TYPE_STRING: u8 = 0x02;
const TYPE_RAW: u8 = 0x07;
const TYPE_ARRAY_U8: u8 = 0x81;
const TYPE_ARRAY_U16: u8 = 0x82;
const TYPE_ARRAY_U32: u8 = 0x83;
const TYPE_ARRAY_I8: u8 = 0x84;
const TYPE_ARRAY_I16: u8 = 0x85;
const TYPE_ARRAY_I32: u8 = 0x86;

/// A typed parameter value.
///
/// Signed and unsigned 32-bit integers are distinct variants so a decoded
/// value re-encodes with the tag it arrived with.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Signed 32-bit integer, two's complement.
    I32(i32),
    /// Unsigned 32-bit integer.
    U32(u32),
    /// NUL-terminated string; byte-transparent up to the terminator.
    String(String),
    /// Raw byte sequence.
    Raw(Bytes),
    /// Little-endian u8 array.
    U8Array(Vec<u8>),
    /// Little-endian u16 array.
    U16Array(Vec<u16>),
    /// Little-endian u32 array.
    U32Array(Vec<u32>),
    /// Little-endian i8 array.
    I8Array(Vec<i8>),
    /// Little-endian i16 array.
    I16Array(Vec<i16>),
    /// Little-endian i32 array.
    I32Array(Vec<i32>),
}

impl Value {
    fn type_tag(&self) -> u8 {
        match self {
            Value::I32(_) => TYPE_I32,
            Value::U32(_) => TYPE_U32,
            Value::String(_) => TYPE_STRING,
            Value::Raw(_) => TYPE_RAW,
            Value::U8Array(_) => TYPE_ARRAY_U8,
            Value::U16Array(_) => TYPE_ARRAY_U16,
            Value::U32Array(_) => TYPE_ARRAY_U32,
            Value::I8Array(_) => TYPE_ARRAY_I8,
            Value::I16Array(_) => TYPE_ARRAY_I16,
            Value::I32Array(_) => TYPE_ARRAY_I32,
        }
    }

    /// Returns the contained `I32`, if that is what this value is.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the contained `U32`, if that is what this value is.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the contained string, if that is what this value is.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the contained raw bytes, if that is what this value is.
    pub fn as_raw(&self) -> Option<&Bytes> {
        match self {
            Value::Raw(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::U32(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Raw(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::U8Array(v)
    }
}

impl From<Vec<u16>> for Value {
    fn from(v: Vec<u16>) -> Self {
        Value::U16Array(v)
    }
}

impl From<Vec<u32>> for Value {
    fn from(v: Vec<u32>) -> Self {
        Value::U32Array(v)
    }
}

impl From<Vec<i8>> for Value {
    fn from(v: Vec<i8>) -> Self {
        Value::I8Array(v)
    }
}

impl From<Vec<i16>> for Value {
    fn from(v: Vec<i16>) -> Self {
        Value::I16Array(v)
    }
}

impl From<Vec<i32>> for Value {
    fn from(v: Vec<i32>) -> Self {
        Value::I32Array(v)
    }
}

/// Encodes one parameter (header, payload, padding) onto `buf`.
pub(crate) fn encode_param(
    buf: &mut BytesMut,
    name: &Identifier,
    value: &Value,
) -> FrameResult<()> {
    let start = buf.len();
    buf.put_slice(name.as_bytes());
    buf.put_u32_le(0); // size/type word, patched below
    match value {
        Value::I32(v) => buf.put_i32_le(*v),
        Value::U32(v) => buf.put_u32_le(*v),
        Value::String(v) => {
            if v.as_bytes().contains(&0) {
                return Err(FrameError::MalformedValue(format!(
                    "string parameter {name} contains a NUL byte"
                )));
            }
            buf.put_slice(v.as_bytes());
            buf.put_u8(0);
        }
        Value::Raw(v) => buf.put_slice(v),
        Value::U8Array(v) => buf.put_slice(v),
        Value::U16Array(v) => {
            for item in v {
                buf.put_u16_le(*item);
            }
        }
        Value::U32Array(v) => {
            for item in v {
                buf.put_u32_le(*item);
            }
        }
        Value::I8Array(v) => {
            for item in v {
                buf.put_i8(*item);
            }
        }
        Value::I16Array(v) => {
            for item in v {
                buf.put_i16_le(*item);
            }
        }
        Value::I32Array(v) => {
            for item in v {
                buf.put_i32_le(*item);
            }
        }
    }
    let padding = (4 - (buf.len() - start) % 4) % 4;
    buf.put_bytes(0, padding);
    let size_words = (buf.len() - start) / 4;
    if size_words > 0x00FF_FFFF {
        return Err(FrameError::MalformedValue(format!(
            "parameter {name} exceeds the 24-bit size field"
        )));
    }
    let word = size_words as u32 | u32::from(value.type_tag()) << 24;
    buf[start + 4..start + PARAM_HEADER_SIZE].copy_from_slice(&word.to_le_bytes());
    Ok(())
}

/// Decodes one parameter from the front of `buf`.
///
/// Returns the name, the value, and the exact byte count consumed.
pub(crate) fn decode_param(buf: &[u8]) -> FrameResult<(Identifier, Value, usize)> {
    if buf.len() < PARAM_HEADER_SIZE {
        return Err(FrameError::MalformedValue(
            "truncated parameter header".to_owned(),
        ));
    }
    let name = Identifier::from_wire([buf[0], buf[1], buf[2], buf[3]])?;
    let word = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let size = (word & 0x00FF_FFFF) as usize * 4;
    let tag = (word >> 24) as u8;
    if size < PARAM_HEADER_SIZE || size > buf.len() {
        return Err(FrameError::MalformedValue(format!(
            "parameter {name} declares {size} bytes, {} available",
            buf.len()
        )));
    }
    let payload = &buf[PARAM_HEADER_SIZE..size];
    let value = decode_value(tag, payload)
        .map_err(|err| FrameError::MalformedValue(format!("parameter {name}: {err}")))?;
    Ok((name, value, size))
}

fn decode_value(tag: u8, payload: &[u8]) -> Result<Value, String> {
    match tag {
        TYPE_I32 => {
            let bytes = exact_4(payload)?;
            Ok(Value::I32(i32::from_le_bytes(bytes)))
        }
        TYPE_U32 => {
            let bytes = exact_4(payload)?;
            Ok(Value::U32(u32::from_le_bytes(bytes)))
        }
        TYPE_STRING => {
            // Tolerant read: everything up to the first NUL, or the whole
            // payload when the terminator is missing.
            let terminated = payload
                .split(|&byte| byte == 0)
                .next()
                .unwrap_or_default();
            Ok(Value::String(
                String::from_utf8_lossy(terminated).into_owned(),
            ))
        }
        TYPE_RAW => Ok(Value::Raw(Bytes::copy_from_slice(payload))),
        TYPE_ARRAY_U8 => Ok(Value::U8Array(payload.to_vec())),
        TYPE_ARRAY_U16 => Ok(Value::U16Array(
            chunks(payload, 2)?
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
        )),
        TYPE_ARRAY_U32 => Ok(Value::U32Array(
            chunks(payload, 4)?
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )),
        TYPE_ARRAY_I8 => Ok(Value::I8Array(
            payload.iter().map(|&byte| byte as i8).collect(),
        )),
        TYPE_ARRAY_I16 => Ok(Value::I16Array(
            chunks(payload, 2)?
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect(),
        )),
        TYPE_ARRAY_I32 => Ok(Value::I32Array(
            chunks(payload, 4)?
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )),
        _ => Err(format!("unknown type tag 0x{tag:02x}")),
    }
}

fn exact_4(payload: &[u8]) -> Result<[u8; 4], String> {
    <[u8; 4]>::try_from(payload).map_err(|_| format!("expected 4 payload bytes, got {}", payload.len()))
}

fn chunks(payload: &[u8], width: usize) -> Result<std::slice::ChunksExact<'_, u8>, String> {
    if payload.len() % width != 0 {
        return Err(format!(
            "payload of {} bytes is not a multiple of the {width}-byte element width",
            payload.len()
        ));
    }
    Ok(payload.chunks_exact(width))
}
