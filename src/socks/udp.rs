//! SOCKS UDP relay codec
//!
//! Each relayed datagram is framed as `RSV(2) FRAG(1) ATYP ADDR PORT DATA`.
//! Fragmented payloads (non-zero FRAG) are not supported and are rejected at
//! decode. The chunk-stream adapters translate between raw frames and
//! endpoint-tagged chunks; the writer prefers a per-chunk endpoint over the
//! association's request destination, so one association can serve multiple
//! remote peers.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;

use crate::error::SocksError;
use crate::link::{Chunk, ChunkReader, ChunkWriter};
use crate::net::Destination;
use crate::socks::addr::{decode_address_port, write_address_port};

/// Decode one SOCKS UDP frame into its destination and payload.
pub fn decode_udp_packet(packet: &Bytes) -> Result<(Destination, Bytes), SocksError> {
    if packet.len() < 5 {
        return Err(SocksError::InsufficientHeader);
    }
    let frag = packet[2];
    if frag != 0 {
        return Err(SocksError::FragmentedPacket(frag));
    }
    let (address, port, consumed) = decode_address_port(&packet[3..])?;
    let payload = packet.slice(3 + consumed..);
    Ok((Destination::udp(address, port), payload))
}

/// Encode a payload into a SOCKS UDP frame addressed to `dest`.
pub fn encode_udp_packet(dest: &Destination, payload: &[u8]) -> Result<Bytes, SocksError> {
    let mut buf = BytesMut::with_capacity(25 + payload.len());
    buf.extend_from_slice(&[0x00, 0x00, 0x00]);
    write_address_port(&mut buf, &dest.address, dest.port)?;
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Decodes SOCKS UDP frames from an inner chunk stream into endpoint-tagged
/// payload chunks.
pub struct UdpReader {
    inner: Box<dyn ChunkReader>,
}

impl UdpReader {
    /// Wrap a chunk stream of raw frames
    #[must_use]
    pub fn new(inner: Box<dyn ChunkReader>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ChunkReader for UdpReader {
    async fn read_chunk(&mut self) -> io::Result<Option<Chunk>> {
        match self.inner.read_chunk().await? {
            Some(chunk) => {
                let (dest, payload) = decode_udp_packet(&chunk.data)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(Chunk::with_endpoint(payload, dest)))
            }
            None => Ok(None),
        }
    }

    fn interrupt(&mut self) {
        self.inner.interrupt();
    }
}

/// Encodes endpoint-tagged payload chunks into SOCKS UDP frames on an inner
/// chunk stream.
pub struct UdpWriter {
    inner: Box<dyn ChunkWriter>,
    request: Destination,
}

impl UdpWriter {
    /// Wrap a chunk stream; `request` is the association's destination, used
    /// for chunks without their own endpoint.
    #[must_use]
    pub fn new(inner: Box<dyn ChunkWriter>, request: Destination) -> Self {
        Self { inner, request }
    }
}

#[async_trait]
impl ChunkWriter for UdpWriter {
    async fn write_chunk(&mut self, chunk: Chunk) -> io::Result<()> {
        let dest = chunk.endpoint.as_ref().unwrap_or(&self.request);
        let frame = encode_udp_packet(dest, &chunk.data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.write_chunk(Chunk::new(frame)).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.close().await
    }

    fn interrupt(&mut self) {
        self.inner.interrupt();
    }
}
