#![forbid(unsafe_code)]

use port_agent_lib::packet::{Packet, PacketType, RawPacketBuffer, Timestamp};

const MAX_PACKET: usize = 1024;

fn buffer() -> RawPacketBuffer {
    RawPacketBuffer::new(MAX_PACKET * 4, MAX_PACKET, MAX_PACKET).unwrap()
}

fn frame(payload: &[u8]) -> Vec<u8> {
    Packet::new(
        PacketType::DataFromInstrument,
        Timestamp::from_parts(3_650_000_000, 7),
        payload,
    )
    .unwrap()
    .as_bytes()
    .to_vec()
}

#[test]
fn construction_rejects_undersized_capacity() {
    assert!(RawPacketBuffer::new(100, 1024, 1024).is_err());
}

#[test]
fn clean_framed_stream_yields_packets_in_order() {
    let mut buffer = buffer();

    let a = frame(b"alpha");
    let b = frame(b"bravo");
    let c = frame(b"charlie");

    let mut stream = Vec::new();
    stream.extend_from_slice(&a);
    stream.extend_from_slice(&b);
    stream.extend_from_slice(&c);
    buffer.write_raw_data(&stream).unwrap();

    assert_eq!(buffer.next_packet().unwrap().unwrap().as_bytes(), &a[..]);
    assert_eq!(buffer.next_packet().unwrap().unwrap().as_bytes(), &b[..]);
    assert_eq!(buffer.next_packet().unwrap().unwrap().as_bytes(), &c[..]);
    assert!(buffer.next_packet().unwrap().is_none());
}

#[test]
fn sync_split_across_writes_is_held() {
    let mut buffer = buffer();
    let full = frame(b"split sync");

    // First two bytes of the sync arrive alone.
    buffer.write_raw_data(&full[..2]).unwrap();
    assert!(buffer.next_packet().unwrap().is_none());

    // The rest arrives later; no fault, one clean packet.
    buffer.write_raw_data(&full[2..]).unwrap();
    let packet = buffer.next_packet().unwrap().unwrap();
    assert_eq!(packet.packet_type(), PacketType::DataFromInstrument);
    assert_eq!(packet.payload(), b"split sync");
    assert!(buffer.next_packet().unwrap().is_none());
}

#[test]
fn garbage_before_frame_becomes_fault() {
    let mut buffer = buffer();

    let mut stream = vec![0x11, 0x22, 0x33];
    let good = frame(b"good");
    stream.extend_from_slice(&good);
    buffer.write_raw_data(&stream).unwrap();

    let fault = buffer.next_packet().unwrap().unwrap();
    assert_eq!(fault.packet_type(), PacketType::PortAgentFault);
    assert_eq!(fault.payload(), &[0x11, 0x22, 0x33]);

    let packet = buffer.next_packet().unwrap().unwrap();
    assert_eq!(packet.as_bytes(), &good[..]);
    assert!(buffer.next_packet().unwrap().is_none());
}

#[test]
fn bad_checksum_drops_frame_then_recovers() {
    let mut buffer = buffer();

    let mut corrupted = frame(b"payload-one");
    let last = corrupted.len() - 1;
    corrupted[last] ^= 0xFF;

    let good = frame(b"payload-two");

    let mut stream = corrupted.clone();
    stream.extend_from_slice(&good);
    buffer.write_raw_data(&stream).unwrap();

    let fault = buffer.next_packet().unwrap().unwrap();
    assert_eq!(fault.packet_type(), PacketType::PortAgentFault);
    assert_eq!(fault.payload(), &corrupted[..]);

    let packet = buffer.next_packet().unwrap().unwrap();
    assert_eq!(packet.as_bytes(), &good[..]);
}

#[test]
fn invalid_header_resynchronizes() {
    let mut buffer = buffer();

    // Valid sync, but a size field below the header floor.
    let mut bogus = frame(b"abcdef");
    bogus[4] = 0;
    bogus[5] = 4;

    let good = frame(b"recovered");
    let mut stream = bogus.clone();
    stream.extend_from_slice(&good);
    buffer.write_raw_data(&stream).unwrap();

    let fault = buffer.next_packet().unwrap().unwrap();
    assert_eq!(fault.packet_type(), PacketType::PortAgentFault);
    assert_eq!(fault.payload(), &bogus[..]);

    let packet = buffer.next_packet().unwrap().unwrap();
    assert_eq!(packet.as_bytes(), &good[..]);
}

#[test]
fn truncated_packet_waits_for_remainder() {
    let mut buffer = buffer();
    let full = frame(b"trickle feed");

    for chunk in full.chunks(5) {
        assert!(buffer.next_packet().unwrap().is_none());
        buffer.write_raw_data(chunk).unwrap();
    }

    let packet = buffer.next_packet().unwrap().unwrap();
    assert_eq!(packet.payload(), b"trickle feed");
}

#[test]
fn stream_reconstruction_property() {
    // Interleave garbage and frames; the concatenation of all emitted
    // payload-or-fault bytes must reconstruct the written stream.
    let mut buffer = buffer();

    let f1 = frame(b"one");
    let f2 = frame(b"two");
    let garbage1 = vec![0x01, 0x02];
    let garbage2 = vec![0xFF; 10];

    let mut stream = Vec::new();
    stream.extend_from_slice(&garbage1);
    stream.extend_from_slice(&f1);
    stream.extend_from_slice(&garbage2);
    stream.extend_from_slice(&f2);
    buffer.write_raw_data(&stream).unwrap();

    let mut reconstructed = Vec::new();
    while let Some(packet) = buffer.next_packet().unwrap() {
        if packet.packet_type() == PacketType::PortAgentFault {
            reconstructed.extend_from_slice(packet.payload());
        } else {
            reconstructed.extend_from_slice(packet.as_bytes());
        }
    }

    assert_eq!(reconstructed, stream);
}

#[test]
fn overflow_is_reported() {
    let mut buffer = RawPacketBuffer::new(32, 32, 32).unwrap();
    assert!(buffer.write_raw_data(&[0u8; 30]).is_ok());
    assert!(buffer.write_raw_data(&[0u8; 10]).is_err());
}
