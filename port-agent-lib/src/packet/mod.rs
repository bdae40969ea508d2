#![forbid(unsafe_code)]

pub mod framer;
pub mod raw_buffer;
pub mod timestamp;

pub use framer::StreamFramer;
pub use raw_buffer::RawPacketBuffer;
pub use timestamp::Timestamp;

use bytes::{Bytes, BytesMut};

use crate::error::{AgentError, Result};

/// 24-bit frame start marker, transmitted big-endian.
pub const SYNC: u32 = 0xA39D7A;

/// Fixed header length, included in the on-wire packet size.
pub const HEADER_SIZE: usize = 16;

/// Largest payload a frame can carry: 0xFFFF total minus the header.
pub const MAX_PAYLOAD_SIZE: usize = 0xFFEF;

/// Frame type discriminator carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    DataFromInstrument = 1,
    DataFromDriver = 2,
    PortAgentCommand = 3,
    PortAgentStatus = 4,
    PortAgentFault = 5,
    InstrumentCommand = 6,
    PortAgentHeartbeat = 7,
}

impl PacketType {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::DataFromInstrument),
            2 => Some(Self::DataFromDriver),
            3 => Some(Self::PortAgentCommand),
            4 => Some(Self::PortAgentStatus),
            5 => Some(Self::PortAgentFault),
            6 => Some(Self::InstrumentCommand),
            7 => Some(Self::PortAgentHeartbeat),
            _ => None,
        }
    }

    /// Canonical name used in the ASCII packet rendering.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DataFromInstrument => "DATA_FROM_INSTRUMENT",
            Self::DataFromDriver => "DATA_FROM_DRIVER",
            Self::PortAgentCommand => "PORT_AGENT_COMMAND",
            Self::PortAgentStatus => "PORT_AGENT_STATUS",
            Self::PortAgentFault => "PORT_AGENT_FAULT",
            Self::InstrumentCommand => "INSTRUMENT_COMMAND",
            Self::PortAgentHeartbeat => "PORT_AGENT_HEARTBEAT",
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A fully composed port agent frame: 16-byte header plus payload.
///
/// The frame is immutable once constructed; the checksum is computed at
/// build time and never recomputed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    packet_type: PacketType,
    timestamp: Timestamp,
    frame: Bytes,
}

impl Packet {
    /// Compose a frame from its parts. Fails when the payload exceeds the
    /// 16-bit size field's reach.
    pub fn new(packet_type: PacketType, timestamp: Timestamp, payload: &[u8]) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(AgentError::ParamOutOfRange(format!(
                "payload size {} exceeds {}",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        let packet_size = (HEADER_SIZE + payload.len()) as u16;
        let mut frame = BytesMut::with_capacity(packet_size as usize);
        frame.extend_from_slice(&SYNC.to_be_bytes()[1..]);
        frame.extend_from_slice(&[packet_type as u8]);
        frame.extend_from_slice(&packet_size.to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&timestamp.as_binary());
        frame.extend_from_slice(payload);

        let checksum = xor_checksum(&frame);
        frame[6..8].copy_from_slice(&checksum.to_be_bytes());

        Ok(Self {
            packet_type,
            timestamp,
            frame: frame.freeze(),
        })
    }

    /// Reconstruct a packet from its wire bytes, verifying sync, type,
    /// size and checksum.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < HEADER_SIZE {
            return Err(AgentError::MalformedFrame(format!(
                "frame shorter than header: {} bytes",
                raw.len()
            )));
        }

        let sync = u32::from_be_bytes([0, raw[0], raw[1], raw[2]]);
        if sync != SYNC {
            return Err(AgentError::MalformedFrame(format!("bad sync {sync:#08x}")));
        }

        let packet_type =
            PacketType::from_wire(raw[3]).ok_or(AgentError::UnknownPacketType(raw[3]))?;

        let size = u16::from_be_bytes([raw[4], raw[5]]) as usize;
        if size != raw.len() {
            return Err(AgentError::MalformedFrame(format!(
                "size field {size} does not match frame length {}",
                raw.len()
            )));
        }

        let expected = u16::from_be_bytes([raw[6], raw[7]]);
        let actual = xor_checksum(raw);
        if expected != actual {
            return Err(AgentError::MalformedFrame(format!(
                "checksum mismatch: header {expected:#06x}, computed {actual:#06x}"
            )));
        }

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&raw[8..16]);

        Ok(Self {
            packet_type,
            timestamp: Timestamp::from_binary(ts),
            frame: Bytes::copy_from_slice(raw),
        })
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn packet_size(&self) -> u16 {
        self.frame.len() as u16
    }

    pub fn payload_size(&self) -> u16 {
        (self.frame.len() - HEADER_SIZE) as u16
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.frame[6], self.frame[7]])
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn payload(&self) -> &[u8] {
        &self.frame[HEADER_SIZE..]
    }

    /// The complete on-wire frame.
    pub fn as_bytes(&self) -> &[u8] {
        &self.frame
    }

    /// ASCII rendering; payload bytes are emitted unescaped.
    pub fn as_ascii(&self) -> Vec<u8> {
        let open = format!(
            "<port_agent_packet type=\"{}\" time=\"{}\">",
            self.packet_type.name(),
            self.timestamp.as_number()
        );
        let mut out = Vec::with_capacity(open.len() + self.payload().len() + 24);
        out.extend_from_slice(open.as_bytes());
        out.extend_from_slice(self.payload());
        out.extend_from_slice(b"</port_agent_packet>\n\r");
        out
    }

    /// Multi-line human readable dump for trace-level diagnostics.
    pub fn pretty(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "Sync: {SYNC:#08x}");
        let _ = writeln!(
            out,
            "Type: {} ({})",
            self.packet_type as u8,
            self.packet_type.name()
        );
        let _ = writeln!(out, "Size: {}", self.packet_size());
        let _ = writeln!(out, "Checksum: {:#06x}", self.checksum());
        let _ = writeln!(out, "Timestamp: {}", self.timestamp.as_number());

        out.push_str("Payload (ascii): ");
        for &byte in self.payload() {
            if byte.is_ascii_graphic() || byte == b' ' {
                out.push(byte as char);
            } else {
                let _ = write!(out, "{byte:#04x}");
            }
        }
        out.push('\n');

        out.push_str("Full packet (hex):");
        for (i, byte) in self.frame.iter().enumerate() {
            if i % 16 == 0 {
                out.push('\n');
            }
            let _ = write!(out, "{byte:02x} ");
        }
        out.push('\n');
        out
    }
}

/// XOR parity over the frame, skipping the two checksum bytes themselves.
pub fn xor_checksum(frame: &[u8]) -> u16 {
    let mut checksum: u16 = 0;
    for (i, &byte) in frame.iter().enumerate() {
        if !(6..=7).contains(&i) {
            checksum ^= u16::from(byte);
        }
    }
    checksum
}

/// Header sanity check against a configured frame-size ceiling: sync marker,
/// known type, and a size within `HEADER_SIZE..=max_packet_size`.
pub fn validate_header(header: &[u8], max_packet_size: usize) -> bool {
    if header.len() < HEADER_SIZE {
        return false;
    }

    let sync = u32::from_be_bytes([0, header[0], header[1], header[2]]);
    if sync != SYNC {
        return false;
    }

    if PacketType::from_wire(header[3]).is_none() {
        return false;
    }

    let size = u16::from_be_bytes([header[4], header[5]]) as usize;
    (HEADER_SIZE..=max_packet_size).contains(&size)
}

/// Recompute the XOR parity of a complete frame and compare against the
/// header field.
pub fn validate_checksum(frame: &[u8]) -> bool {
    if frame.len() < HEADER_SIZE {
        return false;
    }
    u16::from_be_bytes([frame[6], frame[7]]) == xor_checksum(frame)
}

/// Packet size declared in a raw header.
pub fn header_packet_size(header: &[u8]) -> usize {
    u16::from_be_bytes([header[4], header[5]]) as usize
}
