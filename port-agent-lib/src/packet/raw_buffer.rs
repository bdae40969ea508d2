#![forbid(unsafe_code)]

use tracing::debug;

use crate::buffer::CircularBuffer;
use crate::error::{AgentError, Result};
use crate::packet::{
    header_packet_size, validate_checksum, validate_header, Packet, PacketType, Timestamp,
    HEADER_SIZE, SYNC,
};

const SYNC_BYTES: [u8; 3] = [
    (SYNC >> 16) as u8,
    (SYNC >> 8) as u8,
    SYNC as u8,
];

/// Reassembles port-agent frames from an upstream that already emits them
/// (the RSN digi), resynchronizing across corruption.
///
/// Arbitrary byte chunks go in through `write_raw_data`; completed packets
/// come out one at a time from `next_packet`. Bytes that cannot be part of
/// a valid frame are drained as `PORT_AGENT_FAULT` packets carrying the
/// discarded bytes verbatim, so the concatenation of all emitted payloads
/// reconstructs the input stream.
pub struct RawPacketBuffer {
    buffer: CircularBuffer,
    max_packet_size: usize,
    max_invalid_data: usize,
}

impl RawPacketBuffer {
    /// `max_invalid_data` is clamped to `max_packet_size`; a capacity
    /// smaller than one packet cannot reassemble and is rejected.
    pub fn new(capacity: usize, max_packet_size: usize, max_invalid_data: usize) -> Result<Self> {
        if max_packet_size > capacity {
            return Err(AgentError::ParamOutOfRange(
                "packet size greater than buffer capacity".into(),
            ));
        }

        Ok(Self {
            buffer: CircularBuffer::new(capacity),
            max_packet_size,
            max_invalid_data: max_invalid_data.min(max_packet_size),
        })
    }

    pub fn buffered(&self) -> usize {
        self.buffer.size()
    }

    /// Buffer an incoming chunk. The whole chunk must fit.
    pub fn write_raw_data(&mut self, data: &[u8]) -> Result<()> {
        let written = self.buffer.write(data);
        if written < data.len() {
            return Err(AgentError::RawBufferOverflow);
        }
        Ok(())
    }

    /// Pull the next complete packet, a fault packet for leading garbage,
    /// or nothing when the buffer holds only a partial frame.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        // Leading invalid data drains first, as its own fault packet.
        if let Some(fault) = self.drain_leading_invalid(false)? {
            return Ok(Some(fault));
        }

        self.check_for_packet()
    }

    fn check_for_packet(&mut self) -> Result<Option<Packet>> {
        if self.buffer.size() < HEADER_SIZE {
            debug!("header possibly truncated");
            return Ok(None);
        }

        let mut header = [0u8; HEADER_SIZE];
        self.buffer.peek(&mut header);
        self.buffer.reset_peek();

        if !validate_header(&header, self.max_packet_size) {
            debug!("invalid header, resynchronizing");
            return self.drain_leading_invalid(true);
        }

        let packet_size = header_packet_size(&header);
        if packet_size > self.buffer.size() {
            debug!("packet possibly truncated");
            return Ok(None);
        }

        let mut frame = vec![0u8; packet_size];
        self.buffer.peek(&mut frame);
        self.buffer.reset_peek();

        if !validate_checksum(&frame) {
            debug!("invalid checksum, discarding prospective packet");
            return self.drain_leading_invalid(true);
        }

        self.buffer.discard(packet_size);
        Packet::from_bytes(&frame).map(Some)
    }

    /// Count bytes that precede the next sync marker (treating the current
    /// sync as corrupt when `invalid_sync` is set), consume them, and wrap
    /// them in a fault packet. Partial sync bytes at the end of the buffer
    /// stay put so a marker split across writes still resynchronizes.
    fn drain_leading_invalid(&mut self, invalid_sync: bool) -> Result<Option<Packet>> {
        let mut invalid_bytes = 0usize;
        let mut sync_index = 0usize;

        if invalid_sync && self.buffer.size() >= SYNC_BYTES.len() {
            let mut skipped = [0u8; 3];
            invalid_bytes = self.buffer.peek(&mut skipped);
        }

        while let Some(byte) = self.buffer.peek_next_byte() {
            if byte == SYNC_BYTES[sync_index] {
                sync_index += 1;
                if sync_index == SYNC_BYTES.len() {
                    break;
                }
            } else {
                invalid_bytes += 1 + sync_index;
                sync_index = 0;
                if invalid_bytes > self.max_invalid_data {
                    debug!("reached maximum invalid data size");
                    break;
                }
            }
        }

        if sync_index > 0 && sync_index < SYNC_BYTES.len() {
            debug!(held = sync_index, "sync possibly truncated, holding bytes");
        }

        self.buffer.reset_peek();

        if invalid_bytes == 0 {
            return Ok(None);
        }

        let mut discarded = vec![0u8; invalid_bytes];
        let read = self.buffer.read(&mut discarded);
        debug_assert_eq!(read, invalid_bytes);

        debug!(count = invalid_bytes, "draining invalid bytes as fault");
        Packet::new(PacketType::PortAgentFault, Timestamp::now(), &discarded).map(Some)
    }
}
