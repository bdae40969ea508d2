#![forbid(unsafe_code)]

use bytes::BytesMut;

use crate::error::{AgentError, Result};
use crate::packet::{Packet, PacketType, Timestamp, MAX_PAYLOAD_SIZE};

/// Byte-stream packetizer for opaque instrument sources.
///
/// Bytes are appended one at a time; a packet is delivered as soon as any
/// trigger fires: the payload reaches its maximum size, the configured
/// sentinel sequence appears, or the stream goes quiet for the configured
/// window. The packet timestamp is the timestamp of its first byte.
///
/// Sentinel matching is prefix-anchored over the current suffix: on a
/// mismatch the match index resets and the current byte is retested against
/// the start of the sentinel. There is no further backtracking.
pub struct StreamFramer {
    packet_type: PacketType,
    max_payload: usize,
    quiescent_secs: Option<f64>,
    sentinel: Option<Vec<u8>>,
    payload: BytesMut,
    timestamp: Timestamp,
    last_add: Timestamp,
    sentinel_index: usize,
}

impl StreamFramer {
    pub fn new(
        packet_type: PacketType,
        max_payload: usize,
        quiescent_secs: Option<f64>,
        sentinel: Option<&[u8]>,
    ) -> Result<Self> {
        if max_payload == 0 {
            return Err(AgentError::ParamOutOfRange(
                "max payload must be > 0".into(),
            ));
        }
        if max_payload > MAX_PAYLOAD_SIZE {
            return Err(AgentError::ParamOutOfRange(format!(
                "max payload {max_payload} exceeds {MAX_PAYLOAD_SIZE}"
            )));
        }
        if let Some(secs) = quiescent_secs {
            if secs < 0.0 {
                return Err(AgentError::ParamOutOfRange(
                    "quiescent time must be >= 0".into(),
                ));
            }
        }
        if let Some(sentinel) = sentinel {
            if sentinel.is_empty() {
                return Err(AgentError::ParamOutOfRange(
                    "sentinel sequence provided but empty".into(),
                ));
            }
        }

        Ok(Self {
            packet_type,
            max_payload,
            quiescent_secs: quiescent_secs.filter(|secs| *secs > 0.0),
            sentinel: sentinel.map(<[u8]>::to_vec),
            payload: BytesMut::new(),
            timestamp: Timestamp::default(),
            last_add: Timestamp::default(),
            sentinel_index: 0,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn has_quiescent(&self) -> bool {
        self.quiescent_secs.is_some()
    }

    pub fn has_sentinel(&self) -> bool {
        self.sentinel.is_some()
    }

    /// Append one byte; returns the completed packet when the size or
    /// sentinel trigger fires.
    pub fn push(&mut self, byte: u8, ts: Timestamp) -> Result<Option<Packet>> {
        if self.payload.is_empty() {
            self.timestamp = ts;
        }

        self.payload.extend_from_slice(&[byte]);
        self.last_add = ts;

        if let Some(sentinel) = &self.sentinel {
            if sentinel[self.sentinel_index] == byte {
                self.sentinel_index += 1;
            } else {
                self.sentinel_index = usize::from(sentinel[0] == byte);
            }

            if self.sentinel_index == sentinel.len() {
                return self.emit().map(Some);
            }
        }

        if self.payload.len() >= self.max_payload {
            return self.emit().map(Some);
        }

        Ok(None)
    }

    /// Timer-path drain: deliver the partial packet once the stream has
    /// been quiet for the configured window.
    pub fn take_if_quiescent(&mut self) -> Result<Option<Packet>> {
        match self.quiescent_secs {
            Some(secs) if !self.payload.is_empty() && self.last_add.elapsed() >= secs => {
                self.emit().map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Force-deliver whatever has accumulated.
    pub fn flush(&mut self) -> Result<Option<Packet>> {
        if self.payload.is_empty() {
            return Ok(None);
        }
        self.emit().map(Some)
    }

    fn emit(&mut self) -> Result<Packet> {
        let packet = Packet::new(self.packet_type, self.timestamp, &self.payload)?;
        self.payload.clear();
        self.sentinel_index = 0;
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framer(max_payload: usize, sentinel: Option<&[u8]>) -> StreamFramer {
        StreamFramer::new(PacketType::DataFromInstrument, max_payload, None, sentinel).unwrap()
    }

    #[test]
    fn construction_rejects_bad_parameters() {
        assert!(StreamFramer::new(PacketType::DataFromInstrument, 0, None, None).is_err());
        assert!(
            StreamFramer::new(PacketType::DataFromInstrument, MAX_PAYLOAD_SIZE + 1, None, None)
                .is_err()
        );
        assert!(StreamFramer::new(PacketType::DataFromInstrument, 8, Some(-1.0), None).is_err());
        assert!(StreamFramer::new(PacketType::DataFromInstrument, 8, None, Some(b"")).is_err());
        assert!(StreamFramer::new(PacketType::DataFromInstrument, MAX_PAYLOAD_SIZE, None, None).is_ok());
    }

    #[test]
    fn size_trigger_fires_at_max_payload() {
        let mut framer = framer(3, None);
        let ts = Timestamp::now();
        assert!(framer.push(b'a', ts).unwrap().is_none());
        assert!(framer.push(b'b', ts).unwrap().is_none());
        let packet = framer.push(b'c', ts).unwrap().expect("packet at size");
        assert_eq!(packet.payload(), b"abc");
        assert!(framer.is_empty());
    }

    #[test]
    fn empty_framer_never_flushes() {
        let mut framer = framer(8, None);
        assert!(framer.flush().unwrap().is_none());
        assert!(framer.take_if_quiescent().unwrap().is_none());
    }
}
