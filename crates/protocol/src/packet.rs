//! Packets: the outermost framed unit on the wire.
//!
//! Packet wire format (little-endian throughout):
//!
//! ```text
//! ┌────────────┬──────────┬─────────────────────────────────────────────┐
//! │ magic      │ 4 bytes  │ DD CC BB AA                                 │
//! ├────────────┼──────────┼─────────────────────────────────────────────┤
//! │ type       │ 4 bytes  │ identifier                                  │
//! ├────────────┼──────────┼─────────────────────────────────────────────┤
//! │ size       │ 4 bytes  │ LE u32, 4-byte words, header + body + footer│
//! ├────────────┼──────────┼─────────────────────────────────────────────┤
//! │ id         │ 4 bytes  │ LE u32, sender-assigned                     │
//! ├────────────┼──────────┼─────────────────────────────────────────────┤
//! │ info       │ 4 bytes  │ LE u32, opaque, zero on generation          │
//! ├────────────┼──────────┼─────────────────────────────────────────────┤
//! │ timestamp  │ 8 bytes  │ seconds (i32) then nanoseconds (i32)        │
//! ├────────────┼──────────┼─────────────────────────────────────────────┤
//! │ format id  │ 4 bytes  │ "NCPL"                                      │
//! ├────────────┼──────────┼─────────────────────────────────────────────┤
//! │ fields     │ N bytes  │ concatenated encoded fields                 │
//! ├────────────┼──────────┼─────────────────────────────────────────────┤
//! │ magic      │ 4 bytes  │ AA BB CC DD                                 │
//! ├────────────┼──────────┼─────────────────────────────────────────────┤
//! │ checksum   │ 4 bytes  │ CRC-32 of bytes 0 .. len-8                  │
//! └────────────┴──────────┴─────────────────────────────────────────────┘
//! ```
//!
//! The encoder always writes a valid CRC. The decoder treats a zero
//! checksum as unchecked and validates any other value.

use crate::error::{FrameError, FrameResult};
use crate::field::{decode_field, encode_field, FieldData};
use crate::identifier::Identifier;
use bytes::{BufMut, Bytes, BytesMut};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Size of the packet header in bytes
pub const PACKET_HEADER_SIZE: usize = 32;

/// Size of the packet footer in bytes
pub const PACKET_FOOTER_SIZE: usize = 8;

const PACKET_HEADER_MAGIC: [u8; 4] = [0xDD, 0xCC, 0xBB, 0xAA];
const PACKET_FOOTER_MAGIC: [u8; 4] = [0xAA, 0xBB, 0xCC, 0xDD];
const PACKET_FORMAT_ID: [u8; 4] = *b"NCPL";

/// A packet timestamp: seconds since the Unix epoch plus nanoseconds
/// within the second, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    /// Whole seconds since the Unix epoch.
    pub seconds: i32,

    /// Nanoseconds within the second.
    pub nanos: i32,
}

impl Timestamp {
    /// The Unix epoch.
    pub const EPOCH: Timestamp = Timestamp { seconds: 0, nanos: 0 };

    /// The current wall-clock time.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Timestamp {
            seconds: elapsed.as_secs() as i32,
            nanos: elapsed.subsec_nanos() as i32,
        }
    }
}

/// The outermost framed unit on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Packet type identifier.
    pub packet_type: Identifier,

    /// Sender-assigned id. Monotonic per connection for original requests;
    /// the replied-to field id for replies.
    pub id: u32,

    /// When the packet was generated.
    pub timestamp: Timestamp,

    /// Opaque info word, zero on generation.
    pub info: u32,

    /// Fields in wire order.
    pub fields: Vec<FieldData>,
}

/// Everything the 32-byte header says about a packet.
///
/// Produced by [`decode_packet_header`] so a streaming reader knows how many
/// body bytes to fetch before finishing the decode.
#[derive(Debug, Clone)]
pub(crate) struct PacketHeader {
    pub packet_type: Identifier,
    pub id: u32,
    pub info: u32,
    pub timestamp: Timestamp,
    /// Bytes remaining after the header: fields plus footer.
    pub body_len: usize,
}

/// Encodes a packet, including a freshly computed footer CRC.
pub fn encode_packet(packet: &Packet) -> FrameResult<Bytes> {
    let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + PACKET_FOOTER_SIZE);
    buf.put_slice(&PACKET_HEADER_MAGIC);
    buf.put_slice(packet.packet_type.as_bytes());
    buf.put_u32_le(0); // size in words, patched below
    buf.put_u32_le(packet.id);
    buf.put_u32_le(packet.info);
    buf.put_i32_le(packet.timestamp.seconds);
    buf.put_i32_le(packet.timestamp.nanos);
    buf.put_slice(&PACKET_FORMAT_ID);
    for field in &packet.fields {
        encode_field(&mut buf, field)?;
    }
    let size_words = ((buf.len() + PACKET_FOOTER_SIZE) / 4) as u32;
    buf[8..12].copy_from_slice(&size_words.to_le_bytes());
    let checksum = crc32fast::hash(&buf);
    buf.put_slice(&PACKET_FOOTER_MAGIC);
    buf.put_u32_le(checksum);
    Ok(buf.freeze())
}

/// Decodes the fixed 32-byte packet header.
pub(crate) fn decode_packet_header(buf: &[u8]) -> FrameResult<PacketHeader> {
    if buf.len() != PACKET_HEADER_SIZE {
        return Err(FrameError::MalformedPacket(format!(
            "expected a {PACKET_HEADER_SIZE}-byte header, got {}",
            buf.len()
        )));
    }
    if buf[0..4] != PACKET_HEADER_MAGIC {
        return Err(FrameError::MalformedPacket(format!(
            "invalid header magic {:02x?}",
            &buf[0..4]
        )));
    }
    let packet_type = Identifier::from_wire([buf[4], buf[5], buf[6], buf[7]])?;
    let size = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize * 4;
    let id = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
    let info = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
    let seconds = i32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);
    let nanos = i32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]);
    if buf[28..32] != PACKET_FORMAT_ID {
        return Err(FrameError::MalformedPacket(format!(
            "unsupported format id {:02x?}",
            &buf[28..32]
        )));
    }
    if size < PACKET_HEADER_SIZE + PACKET_FOOTER_SIZE {
        return Err(FrameError::MalformedPacket(format!(
            "declared packet size {size} is below the framing minimum"
        )));
    }
    Ok(PacketHeader {
        packet_type,
        id,
        info,
        timestamp: Timestamp { seconds, nanos },
        body_len: size - PACKET_HEADER_SIZE,
    })
}

/// Finishes a decode started by [`decode_packet_header`].
///
/// `header_bytes` are the raw 32 header bytes, needed to validate the
/// footer CRC, which covers them.
pub(crate) fn decode_packet_body(
    header: PacketHeader,
    header_bytes: &[u8],
    body: &[u8],
) -> FrameResult<Packet> {
    if body.len() != header.body_len {
        return Err(FrameError::MalformedPacket(format!(
            "expected {} body bytes, got {}",
            header.body_len,
            body.len()
        )));
    }
    let footer = &body[body.len() - PACKET_FOOTER_SIZE..];
    if footer[0..4] != PACKET_FOOTER_MAGIC {
        return Err(FrameError::MalformedPacket(format!(
            "invalid footer magic {:02x?}",
            &footer[0..4]
        )));
    }
    let checksum = u32::from_le_bytes([footer[4], footer[5], footer[6], footer[7]]);
    if checksum != 0 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(header_bytes);
        hasher.update(&body[..body.len() - PACKET_FOOTER_SIZE]);
        let computed = hasher.finalize();
        if computed != checksum {
            return Err(FrameError::MalformedPacket(format!(
                "checksum mismatch: computed {computed:#010x}, packet carries {checksum:#010x}"
            )));
        }
    }
    let field_limit = body.len() - PACKET_FOOTER_SIZE;
    let mut fields = Vec::new();
    let mut offset = 0;
    while offset < field_limit {
        let (field, consumed) = decode_field(&body[offset..field_limit])?;
        fields.push(field);
        offset += consumed;
    }
    Ok(Packet {
        packet_type: header.packet_type,
        id: header.id,
        timestamp: header.timestamp,
        info: header.info,
        fields,
    })
}

/// Decodes one complete packet from `buf`, which must contain exactly the
/// bytes the header declares.
pub fn decode_packet(buf: &[u8]) -> FrameResult<Packet> {
    if buf.len() < PACKET_HEADER_SIZE {
        return Err(FrameError::MalformedPacket(format!(
            "{} bytes is too short for a packet header",
            buf.len()
        )));
    }
    let header = decode_packet_header(&buf[..PACKET_HEADER_SIZE])?;
    if buf.len() != PACKET_HEADER_SIZE + header.body_len {
        return Err(FrameError::MalformedPacket(format!(
            "declared size {} does not match the {} bytes supplied",
            PACKET_HEADER_SIZE + header.body_len,
            buf.len()
        )));
    }
    decode_packet_body(header, &buf[..PACKET_HEADER_SIZE], &buf[PACKET_HEADER_SIZE..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Params;
    use crate::value::Value;

    fn sample_packet() -> Packet {
        let mut params = Params::new();
        params.insert(Identifier::new("SAMP").unwrap(), 1024i32);
        Packet {
            packet_type: Identifier::new("DSPC").unwrap(),
            id: 2,
            timestamp: Timestamp { seconds: 1423, nanos: 7_000 },
            info: 0,
            fields: vec![FieldData::new(Identifier::new("TIME").unwrap(), 1, params)],
        }
    }

    #[test]
    fn test_empty_packet_roundtrip() {
        let packet = Packet {
            packet_type: Identifier::new("LINK").unwrap(),
            id: 1,
            timestamp: Timestamp::EPOCH,
            info: 0,
            fields: Vec::new(),
        };
        let bytes = encode_packet(&packet).unwrap();
        assert_eq!(&bytes[0..4], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(bytes.len(), PACKET_HEADER_SIZE + PACKET_FOOTER_SIZE);
        assert_eq!(decode_packet(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_packet_roundtrip() {
        let packet = sample_packet();
        let bytes = encode_packet(&packet).unwrap();
        let decoded = decode_packet(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_framing_invariants() {
        let bytes = encode_packet(&sample_packet()).unwrap();
        let declared = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize * 4;
        assert_eq!(declared, bytes.len());
        assert_eq!(&bytes[0..4], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(
            &bytes[bytes.len() - 8..bytes.len() - 4],
            &[0xAA, 0xBB, 0xCC, 0xDD]
        );
        assert_eq!(&bytes[28..32], b"NCPL");
    }

    #[test]
    fn test_bit_flip_fails_checksum() {
        let bytes = encode_packet(&sample_packet()).unwrap();
        // Flip one bit in every byte covered by the CRC.
        for position in 0..bytes.len() - 8 {
            let mut corrupted = bytes.to_vec();
            corrupted[position] ^= 0x01;
            assert!(
                decode_packet(&corrupted).is_err(),
                "bit flip at byte {position} went undetected"
            );
        }
    }

    #[test]
    fn test_zero_checksum_is_unchecked() {
        let mut bytes = encode_packet(&sample_packet()).unwrap().to_vec();
        let len = bytes.len();
        bytes[len - 4..].copy_from_slice(&0u32.to_le_bytes());
        assert!(decode_packet(&bytes).is_ok());
    }

    #[test]
    fn test_invalid_header_magic() {
        let mut bytes = encode_packet(&sample_packet()).unwrap().to_vec();
        bytes[0] = 0x00;
        assert!(matches!(
            decode_packet(&bytes),
            Err(FrameError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_invalid_format_id() {
        let mut bytes = encode_packet(&sample_packet()).unwrap().to_vec();
        bytes[28..32].copy_from_slice(b"XXXX");
        assert!(matches!(
            decode_packet(&bytes),
            Err(FrameError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_field_order_survives_roundtrip() {
        let packet = Packet {
            packet_type: Identifier::new("STAT").unwrap(),
            id: 9,
            timestamp: Timestamp::EPOCH,
            info: 0,
            fields: vec![
                FieldData::new(Identifier::new("OCON").unwrap(), 10, Params::new()),
                FieldData::new(Identifier::new("ELOC").unwrap(), 11, Params::new()),
                FieldData::new(Identifier::new("SGPS").unwrap(), 12, Params::new()),
            ],
        };
        let decoded = decode_packet(&encode_packet(&packet).unwrap()).unwrap();
        let names: Vec<_> = decoded.fields.iter().map(|f| f.name.as_str().to_owned()).collect();
        assert_eq!(names, ["OCON", "ELOC", "SGPS"]);
        // Byte-for-byte stable on a second pass.
        assert_eq!(
            encode_packet(&decoded).unwrap(),
            encode_packet(&packet).unwrap()
        );
    }

    #[test]
    fn test_array_payload_roundtrip() {
        let mut params = Params::new();
        params.insert(Identifier::new("PDAT").unwrap(), vec![1i16, 2, 3, 4]);
        let packet = Packet {
            packet_type: Identifier::new("DSPC").unwrap(),
            id: 3,
            timestamp: Timestamp::EPOCH,
            info: 0,
            fields: vec![FieldData::new(Identifier::new("SWEP").unwrap(), 2, params)],
        };
        let decoded = decode_packet(&encode_packet(&packet).unwrap()).unwrap();
        match decoded.fields[0].params.get("PDAT") {
            Some(Value::I16Array(items)) => assert_eq!(items, &[1, 2, 3, 4]),
            other => panic!("unexpected PDAT value: {other:?}"),
        }
    }
}
