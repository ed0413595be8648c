//! Fields: named bags of typed parameters, and their wire codec.
//!
//! Field wire format:
//!
//! ```text
//! ┌─────────────────┬──────────┬───────────────────────────────────────┐
//! │ name            │ 4 bytes  │ identifier                            │
//! ├─────────────────┼──────────┼───────────────────────────────────────┤
//! │ size            │ 4 bytes  │ LE u32, 4-byte words, header + footer │
//! ├─────────────────┼──────────┼───────────────────────────────────────┤
//! │ type id         │ 4 bytes  │ identifier chosen by the sender       │
//! ├─────────────────┼──────────┼───────────────────────────────────────┤
//! │ field id        │ 4 bytes  │ LE u32, unique within the packet      │
//! ├─────────────────┼──────────┼───────────────────────────────────────┤
//! │ parameter count │ 4 bytes  │ LE u32                                │
//! ├─────────────────┼──────────┼───────────────────────────────────────┤
//! │ parameters      │ N bytes  │ see the value codec                   │
//! ├─────────────────┼──────────┼───────────────────────────────────────┤
//! │ checksum        │ 4 bytes  │ written zero, unchecked on decode     │
//! └─────────────────┴──────────┴───────────────────────────────────────┘
//! ```

use crate::error::{FrameError, FrameResult};
use crate::identifier::Identifier;
use crate::value::{decode_param, encode_param, Value};
use bytes::{BufMut, BytesMut};

/// Size of the field header in bytes
pub const FIELD_HEADER_SIZE: usize = 20;

/// Size of the field footer (checksum word) in bytes
pub const FIELD_FOOTER_SIZE: usize = 4;

/// An insertion-ordered mapping of parameter names to values.
///
/// Parameter order is preserved on the wire. Names are unique; inserting an
/// existing name replaces the value in place.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Params(Vec<(Identifier, Value)>);

impl Params {
    /// Creates an empty parameter map.
    pub fn new() -> Self {
        Params(Vec::new())
    }

    /// Inserts a parameter, replacing any existing value for the same name
    /// without disturbing its position.
    pub fn insert(&mut self, name: Identifier, value: impl Into<Value>) {
        let value = value.into();
        match self.0.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    /// Looks up a parameter by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates parameters in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Identifier, &Value)> {
        self.0.iter().map(|(name, value)| (name, value))
    }
}

impl FromIterator<(Identifier, Value)> for Params {
    fn from_iter<T: IntoIterator<Item = (Identifier, Value)>>(iter: T) -> Self {
        let mut params = Params::new();
        for (name, value) in iter {
            params.insert(name, value);
        }
        params
    }
}

impl IntoIterator for Params {
    type Item = (Identifier, Value);
    type IntoIter = std::vec::IntoIter<(Identifier, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// One logical message within a packet.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldData {
    /// Field name.
    pub name: Identifier,

    /// Sender-assigned id, unique within the packet.
    pub id: u32,

    /// Sender-chosen type identifier.
    pub type_id: Identifier,

    /// Parameters in wire order.
    pub params: Params,
}

impl FieldData {
    /// Creates a field whose type id mirrors its name, the convention used
    /// for all library-generated traffic.
    pub fn new(name: Identifier, id: u32, params: Params) -> Self {
        FieldData {
            name,
            id,
            type_id: name,
            params,
        }
    }
}

/// Encodes one field (header, parameters, footer) onto `buf`.
pub(crate) fn encode_field(buf: &mut BytesMut, field: &FieldData) -> FrameResult<()> {
    let start = buf.len();
    buf.put_slice(field.name.as_bytes());
    buf.put_u32_le(0); // size in words, patched below
    buf.put_slice(field.type_id.as_bytes());
    buf.put_u32_le(field.id);
    buf.put_u32_le(field.params.len() as u32);
    for (name, value) in field.params.iter() {
        encode_param(buf, name, value)?;
    }
    buf.put_u32_le(0); // checksum word
    let size_words = ((buf.len() - start) / 4) as u32;
    buf[start + 4..start + 8].copy_from_slice(&size_words.to_le_bytes());
    Ok(())
}

/// Decodes one field from the front of `buf`.
///
/// Returns the field and the exact byte count consumed. The declared size
/// must match the bytes the parameters actually occupy.
pub(crate) fn decode_field(buf: &[u8]) -> FrameResult<(FieldData, usize)> {
    if buf.len() < FIELD_HEADER_SIZE + FIELD_FOOTER_SIZE {
        return Err(FrameError::MalformedField(
            "truncated field header".to_owned(),
        ));
    }
    let name = Identifier::from_wire([buf[0], buf[1], buf[2], buf[3]])?;
    let size = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize * 4;
    let type_id = Identifier::from_wire([buf[8], buf[9], buf[10], buf[11]])?;
    let id = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
    let param_count = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
    if size < FIELD_HEADER_SIZE + FIELD_FOOTER_SIZE || size > buf.len() {
        return Err(FrameError::MalformedField(format!(
            "field {name} declares {size} bytes, {} available",
            buf.len()
        )));
    }
    let param_limit = size - FIELD_FOOTER_SIZE;
    let mut offset = FIELD_HEADER_SIZE;
    let mut params = Params::new();
    for _ in 0..param_count {
        let (param_name, value, consumed) = decode_param(&buf[offset..param_limit])?;
        params.insert(param_name, value);
        offset += consumed;
    }
    if offset != param_limit {
        return Err(FrameError::MalformedField(format!(
            "field {name} size mismatch: {offset} bytes consumed, {param_limit} declared"
        )));
    }
    // Footer checksum word is unchecked.
    Ok((FieldData { name, id, type_id, params }, size))
}
