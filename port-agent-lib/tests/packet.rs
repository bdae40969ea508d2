#![forbid(unsafe_code)]

use port_agent_lib::packet::{
    validate_checksum, validate_header, xor_checksum, Packet, PacketType, Timestamp, HEADER_SIZE,
    MAX_PAYLOAD_SIZE,
};

fn sample_timestamp() -> Timestamp {
    Timestamp::from_parts(3_600_000_000, 0x8000_0000)
}

#[test]
fn composed_frame_layout() {
    let packet = Packet::new(
        PacketType::DataFromInstrument,
        sample_timestamp(),
        b"hello",
    )
    .unwrap();

    let bytes = packet.as_bytes();
    assert_eq!(&bytes[..3], &[0xA3, 0x9D, 0x7A]);
    assert_eq!(bytes[3], 1);
    assert_eq!(u16::from_be_bytes([bytes[4], bytes[5]]), 21);
    assert_eq!(&bytes[16..], b"hello");
    assert_eq!(packet.packet_size(), 21);
    assert_eq!(packet.payload_size(), 5);
}

#[test]
fn size_is_header_plus_payload() {
    for len in [0usize, 1, 57, 1024] {
        let payload = vec![0xAB; len];
        let packet = Packet::new(PacketType::DataFromDriver, sample_timestamp(), &payload).unwrap();
        assert_eq!(packet.packet_size() as usize, HEADER_SIZE + len);
    }
}

#[test]
fn checksum_is_xor_excluding_checksum_field() {
    let packet =
        Packet::new(PacketType::PortAgentStatus, sample_timestamp(), b"status ok").unwrap();
    let bytes = packet.as_bytes();

    let mut expected: u16 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        if i < 6 || i > 7 {
            expected ^= u16::from(byte);
        }
    }
    assert_eq!(packet.checksum(), expected);
    assert!(validate_checksum(bytes));

    // XOR over the frame with the checksum bytes masked out is zero
    // against itself.
    assert_eq!(xor_checksum(bytes), packet.checksum());
}

#[test]
fn wire_round_trip() {
    let payload: Vec<u8> = (0u16..=255).map(|b| b as u8).collect();
    let original = Packet::new(PacketType::DataFromInstrument, sample_timestamp(), &payload).unwrap();

    let parsed = Packet::from_bytes(original.as_bytes()).unwrap();
    assert_eq!(parsed.as_bytes(), original.as_bytes());
    assert_eq!(parsed.packet_type(), original.packet_type());
    assert_eq!(parsed.timestamp(), original.timestamp());
    assert_eq!(parsed.payload(), original.payload());
}

#[test]
fn from_bytes_rejects_corruption() {
    let packet = Packet::new(PacketType::DataFromDriver, sample_timestamp(), b"abc").unwrap();

    let mut bad_sync = packet.as_bytes().to_vec();
    bad_sync[0] = 0x00;
    assert!(Packet::from_bytes(&bad_sync).is_err());

    let mut bad_type = packet.as_bytes().to_vec();
    bad_type[3] = 9;
    assert!(Packet::from_bytes(&bad_type).is_err());

    let mut bad_checksum = packet.as_bytes().to_vec();
    bad_checksum[17] ^= 0xFF;
    assert!(Packet::from_bytes(&bad_checksum).is_err());

    assert!(Packet::from_bytes(&packet.as_bytes()[..10]).is_err());
}

#[test]
fn payload_boundaries() {
    let max = vec![0u8; MAX_PAYLOAD_SIZE];
    assert!(Packet::new(PacketType::DataFromInstrument, sample_timestamp(), &max).is_ok());

    let too_big = vec![0u8; MAX_PAYLOAD_SIZE + 1];
    assert!(Packet::new(PacketType::DataFromInstrument, sample_timestamp(), &too_big).is_err());
}

#[test]
fn ascii_rendering() {
    let packet = Packet::new(
        PacketType::DataFromInstrument,
        Timestamp::from_parts(3_600_000_000, 0),
        b"SBE37>",
    )
    .unwrap();

    let ascii = packet.as_ascii();
    let text = String::from_utf8(ascii).unwrap();
    assert!(text.starts_with("<port_agent_packet type=\"DATA_FROM_INSTRUMENT\" time=\""));
    assert!(text.contains(">SBE37></port_agent_packet>"));
    assert!(text.ends_with("</port_agent_packet>\n\r"));
}

#[test]
fn ascii_payload_is_unescaped() {
    let packet = Packet::new(
        PacketType::DataFromDriver,
        sample_timestamp(),
        b"a<b>&c\x01",
    )
    .unwrap();
    let ascii = packet.as_ascii();
    let open_end = ascii.iter().position(|&b| b == b'>').unwrap();
    let body = &ascii[open_end + 1..ascii.len() - "</port_agent_packet>\n\r".len()];
    assert_eq!(body, b"a<b>&c\x01");
}

#[test]
fn header_validation_ranges() {
    let packet = Packet::new(PacketType::PortAgentFault, sample_timestamp(), b"xx").unwrap();
    assert!(validate_header(packet.as_bytes(), 1024));

    // Too small a ceiling rejects the frame.
    assert!(!validate_header(packet.as_bytes(), 17));

    let mut bad_size = packet.as_bytes().to_vec();
    bad_size[4] = 0;
    bad_size[5] = 4;
    assert!(!validate_header(&bad_size, 1024));
}

#[test]
fn all_packet_types_round_trip_names() {
    let cases = [
        (PacketType::DataFromInstrument, "DATA_FROM_INSTRUMENT"),
        (PacketType::DataFromDriver, "DATA_FROM_DRIVER"),
        (PacketType::PortAgentCommand, "PORT_AGENT_COMMAND"),
        (PacketType::PortAgentStatus, "PORT_AGENT_STATUS"),
        (PacketType::PortAgentFault, "PORT_AGENT_FAULT"),
        (PacketType::InstrumentCommand, "INSTRUMENT_COMMAND"),
        (PacketType::PortAgentHeartbeat, "PORT_AGENT_HEARTBEAT"),
    ];

    for (packet_type, name) in cases {
        assert_eq!(packet_type.name(), name);
        assert_eq!(PacketType::from_wire(packet_type as u8), Some(packet_type));
    }
    assert_eq!(PacketType::from_wire(0), None);
    assert_eq!(PacketType::from_wire(8), None);
}
