//! Byte-stream framing and in-order packet delivery.
//!
//! [`PacketFramer`] turns arbitrarily split transport chunks back into whole
//! packets; [`ReorderBuffer`] then normalizes arrival order into strict
//! packet-id order before anything above sees them.

use std::collections::HashMap;

use bytes::Bytes;

use crate::protocol::{
    parse_header, Packet, ProtocolError, FRAMER_BUFFER_SIZE, MAX_PACKET_PAYLOAD,
    MAX_REORDER_POOL, PACKET_HEADER_SIZE,
};

/// Reassembles packets from transport chunks of any size and boundary
/// placement. Keeps one fixed accumulation buffer and a countdown of bytes
/// still needed for the current unit (header, then payload).
pub struct PacketFramer {
    buf: Box<[u8]>,
    position: usize,
    bytes_to_read: usize,
}

impl Default for PacketFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketFramer {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; FRAMER_BUFFER_SIZE].into_boxed_slice(),
            position: 0,
            bytes_to_read: PACKET_HEADER_SIZE,
        }
    }

    /// Consume one transport chunk, appending every packet it completes to
    /// `out`. Leftover tail bytes are processed in the same call.
    pub fn push(&mut self, data: &[u8], out: &mut Vec<Packet>) -> Result<(), ProtocolError> {
        let mut rest = data;
        while !rest.is_empty() {
            let take = rest.len().min(self.bytes_to_read);
            self.buf[self.position..self.position + take].copy_from_slice(&rest[..take]);
            self.position += take;
            self.bytes_to_read -= take;
            rest = &rest[take..];

            if self.bytes_to_read > 0 {
                // Mid-header or mid-payload; wait for more data.
                break;
            }

            if self.position == PACKET_HEADER_SIZE {
                let header: [u8; PACKET_HEADER_SIZE] =
                    self.buf[..PACKET_HEADER_SIZE].try_into().unwrap_or_default();
                let (_, length) = parse_header(&header);
                if length > MAX_PACKET_PAYLOAD {
                    return Err(ProtocolError::OversizedPacket(length));
                }
                if length > 0 {
                    self.bytes_to_read = length;
                    continue;
                }
            }

            out.push(self.take_packet());
        }
        Ok(())
    }

    fn take_packet(&mut self) -> Packet {
        let header: [u8; PACKET_HEADER_SIZE] =
            self.buf[..PACKET_HEADER_SIZE].try_into().unwrap_or_default();
        let (id, length) = parse_header(&header);
        let payload =
            Bytes::copy_from_slice(&self.buf[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + length]);
        self.position = 0;
        self.bytes_to_read = PACKET_HEADER_SIZE;
        Packet { id, payload }
    }

    /// Bytes of the current partial unit, if any.
    pub fn pending_bytes(&self) -> usize {
        self.position
    }
}

/// Delivers packets in strictly increasing id order, starting at 1.
/// Early arrivals are pooled until their predecessors show up.
pub struct ReorderBuffer {
    next_id: u32,
    pool: HashMap<u32, Packet>,
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pool: HashMap::new(),
        }
    }

    /// Accept one framed packet, appending every packet now deliverable in
    /// order to `out`. The drain is an iterative loop over the pool, keyed
    /// by the next expected id.
    pub fn accept(&mut self, packet: Packet, out: &mut Vec<Packet>) -> Result<(), ProtocolError> {
        if packet.id != self.next_id {
            if self.pool.len() >= MAX_REORDER_POOL {
                return Err(ProtocolError::ReorderOverflow);
            }
            self.pool.insert(packet.id, packet);
            return Ok(());
        }
        out.push(packet);
        self.next_id += 1;
        while let Some(pooled) = self.pool.remove(&self.next_id) {
            out.push(pooled);
            self.next_id += 1;
        }
        Ok(())
    }

    pub fn pooled(&self) -> usize {
        self.pool.len()
    }
}
