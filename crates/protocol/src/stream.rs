//! Streaming packet I/O over an async byte stream.
//!
//! Packets are self-framed: the reader fetches the fixed 32-byte header,
//! learns the total size from it, then fetches the rest of the packet in
//! one read. There is no stream-level framing to resynchronize on, so any
//! framing fault is fatal to the stream.

use crate::error::NetworkError;
use crate::packet::{
    decode_packet_body, decode_packet_header, encode_packet, Packet, PACKET_HEADER_SIZE,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads a lazy, finite-until-close sequence of packets from a byte stream.
pub struct PacketReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// Wraps a byte stream.
    pub fn new(inner: R) -> Self {
        PacketReader { inner }
    }

    /// Reads the next packet.
    ///
    /// Returns `None` when the stream ends cleanly between packets. A stream
    /// that ends mid-packet yields [`crate::FrameError::UnexpectedEof`].
    pub async fn read_packet(&mut self) -> Result<Option<Packet>, NetworkError> {
        let mut header = [0u8; PACKET_HEADER_SIZE];
        let mut filled = 0;
        while filled < header.len() {
            let count = self.inner.read(&mut header[filled..]).await?;
            if count == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(crate::FrameError::UnexpectedEof.into())
                };
            }
            filled += count;
        }
        let decoded = decode_packet_header(&header)?;
        let mut body = vec![0u8; decoded.body_len];
        self.inner.read_exact(&mut body).await.map_err(eof_aware)?;
        let packet = decode_packet_body(decoded, &header, &body)?;
        Ok(Some(packet))
    }

    /// Consumes the reader, returning the underlying stream.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Encodes `packet` and writes it to `writer` in full.
pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &Packet,
) -> Result<(), NetworkError> {
    let bytes = encode_packet(packet)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

fn eof_aware(err: std::io::Error) -> NetworkError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        crate::FrameError::UnexpectedEof.into()
    } else {
        NetworkError::from(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrameError;
    use crate::field::{FieldData, Params};
    use crate::identifier::Identifier;
    use crate::packet::Timestamp;

    fn link_packet(id: u32) -> Packet {
        Packet {
            packet_type: Identifier::new("LINK").unwrap(),
            id,
            timestamp: Timestamp::EPOCH,
            info: 0,
            fields: vec![FieldData::new(Identifier::new("LINK").unwrap(), id, Params::new())],
        }
    }

    #[tokio::test]
    async fn test_reads_packets_in_sequence() {
        let (client, server) = tokio::io::duplex(4096);
        let (_, mut write_half) = tokio::io::split(client);
        let (read_half, _) = tokio::io::split(server);

        let mut reader = PacketReader::new(read_half);
        for id in 1..=3 {
            write_packet(&mut write_half, &link_packet(id)).await.unwrap();
        }
        for id in 1..=3 {
            let packet = reader.read_packet().await.unwrap().unwrap();
            assert_eq!(packet.id, id);
        }
    }

    #[tokio::test]
    async fn test_close_between_packets_ends_cleanly() {
        let (client, server) = tokio::io::duplex(4096);
        let (_, mut write_half) = tokio::io::split(client);
        let (read_half, _) = tokio::io::split(server);

        write_packet(&mut write_half, &link_packet(1)).await.unwrap();
        drop(write_half);

        let mut reader = PacketReader::new(read_half);
        assert!(reader.read_packet().await.unwrap().is_some());
        assert!(reader.read_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_mid_packet_is_unexpected_eof() {
        let (client, server) = tokio::io::duplex(4096);
        let (_, mut write_half) = tokio::io::split(client);
        let (read_half, _) = tokio::io::split(server);

        let bytes = crate::packet::encode_packet(&link_packet(1)).unwrap();
        write_half.write_all(&bytes[..bytes.len() - 4]).await.unwrap();
        drop(write_half);

        let mut reader = PacketReader::new(read_half);
        assert_eq!(
            reader.read_packet().await,
            Err(NetworkError::Frame(FrameError::UnexpectedEof))
        );
    }

    #[tokio::test]
    async fn test_garbage_header_is_malformed() {
        let (client, server) = tokio::io::duplex(4096);
        let (_, mut write_half) = tokio::io::split(client);
        let (read_half, _) = tokio::io::split(server);

        write_half.write_all(&[0u8; 64]).await.unwrap();

        let mut reader = PacketReader::new(read_half);
        assert!(matches!(
            reader.read_packet().await,
            Err(NetworkError::Frame(FrameError::MalformedPacket(_)))
        ));
    }
}
