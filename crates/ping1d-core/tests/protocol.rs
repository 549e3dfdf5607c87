use ping1d_core::protocol::messages::DistanceReport;
use ping1d_core::protocol::{
    checksum, decode, Decoded, Message, MessageId, Packet, PacketParser, ProtocolError,
    ReplyMatch, RequestTracker, CHECKSUM_SIZE, HEADER_SIZE,
};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

fn distance_frame() -> Vec<u8> {
    Message::DistanceSimple {
        distance: 1234,
        confidence: 88,
    }
    .encode()
}

#[test]
fn test_every_message_id_round_trips() {
    for id in MessageId::ALL {
        assert_eq!(MessageId::from_u16(id.as_u16()), Some(id));
    }
    assert_eq!(MessageId::from_u16(9999), None);
}

fn one_of_each() -> Vec<Message> {
    let report = DistanceReport {
        distance: 4321,
        confidence: 93,
        transmit_duration: 208,
        ping_number: 77,
        scan_start: 500,
        scan_length: 12_000,
        gain_setting: 4,
    };
    vec![
        Message::Ack { acked_id: 1204 },
        Message::Nack { nacked_id: 1005, message: "bad gain".into() },
        Message::AsciiText { message: "boot ok".into() },
        Message::GeneralRequest { requested_id: 1211 },
        Message::SetDeviceId { device_id: 2 },
        Message::SetRange { scan_start: 100, scan_length: 9000 },
        Message::SetSpeedOfSound { speed_of_sound: 1_480_000 },
        Message::SetModeAuto { mode_auto: false },
        Message::SetPingInterval { ping_interval: 100 },
        Message::SetGainIndex { gain_index: 5 },
        Message::SetPingEnable { ping_enabled: true },
        Message::GotoBootloader,
        Message::FirmwareVersion {
            device_type: 1,
            device_model: 1,
            firmware_version_major: 3,
            firmware_version_minor: 28,
        },
        Message::DeviceId { device_id: 2 },
        Message::Voltage5 { voltage_5: 5040 },
        Message::SpeedOfSound { speed_of_sound: 1_500_000 },
        Message::Range { scan_start: 0, scan_length: 30_000 },
        Message::ModeAuto { mode_auto: true },
        Message::PingInterval { ping_interval: 66 },
        Message::GainIndex { gain_index: 6 },
        Message::PulseDuration { pulse_duration: 180 },
        Message::GeneralInfo {
            firmware_version_major: 3,
            firmware_version_minor: 28,
            voltage_5: 5010,
            ping_interval: 66,
            gain_index: 2,
            mode_auto: true,
        },
        Message::DistanceSimple { distance: 2750, confidence: 100 },
        Message::Distance(report),
        Message::ProcessorTemperature { temperature: 4120 },
        Message::PcbTemperature { temperature: 3580 },
        Message::PingEnable { ping_enabled: false },
        Message::Profile { report, profile_data: (0..=255).collect() },
        Message::ContinuousStart { id: 1300 },
        Message::ContinuousStop { id: 1300 },
    ]
}

#[test]
fn test_every_message_survives_the_wire() {
    let messages = one_of_each();
    let covered: BTreeSet<MessageId> = messages.iter().map(Message::id).collect();
    assert_eq!(covered.len(), MessageId::ALL.len());

    let mut stream = Vec::new();
    for (i, message) in messages.iter().enumerate() {
        stream.extend(message.to_packet(i as u8, 0).to_bytes());
    }

    let mut parser = PacketParser::new();
    parser.push(&stream);
    let mut decoded = Vec::new();
    while let Decoded::Message(p) = parser.next_frame() {
        assert_eq!(usize::from(p.src_device_id), decoded.len());
        decoded.push(Message::from_packet(&p).unwrap());
    }

    assert_eq!(decoded, messages);
    assert_eq!(parser.errors, 0);
}

#[test]
fn test_encode_then_decode_is_identity() {
    let packet = Packet::addressed(1211, 3, 7, vec![0xd2, 0x04, 0, 0, 88]);
    let bytes = packet.to_bytes();
    assert_eq!(bytes.len(), HEADER_SIZE + 5 + CHECKSUM_SIZE);

    let (decoded, consumed) = decode(&bytes);
    assert_eq!(consumed, bytes.len());
    match decoded {
        Decoded::Message(p) => assert_eq!(p, packet),
        other => panic!("expected a message, got {:?}", other),
    }
}

#[test]
fn test_checksum_is_wrapping_sum() {
    assert_eq!(checksum(&[0xff; 300]), (0xffu32 * 300) as u16);
    assert_eq!(checksum(&[]), 0);
}

#[test]
fn test_any_single_bit_flip_is_rejected() {
    let frame = distance_frame();
    for byte in 0..frame.len() {
        for bit in 0..8 {
            let mut corrupt = frame.clone();
            corrupt[byte] ^= 1 << bit;
            let mut parser = PacketParser::new();
            parser.push(&corrupt);
            let mut accepted = 0;
            loop {
                match parser.next_frame() {
                    Decoded::Message(_) => accepted += 1,
                    Decoded::Invalid(_) => {}
                    Decoded::NeedMoreBytes => break,
                }
            }
            assert_eq!(accepted, 0, "flip of bit {} in byte {} accepted", bit, byte);
        }
    }
}

#[test]
fn test_corrupt_checksum_consumes_one_byte() {
    let mut frame = distance_frame();
    let last = frame.len() - 1;
    frame[last] ^= 0x01;

    let (decoded, consumed) = decode(&frame);
    assert!(matches!(
        decoded,
        Decoded::Invalid(ProtocolError::ChecksumMismatch { .. })
    ));
    assert_eq!(consumed, 1);
}

#[test]
fn test_parser_resyncs_after_garbage() {
    let mut stream = vec![0x00, 0x42, 0x13, 0x37];
    stream.extend(distance_frame());
    stream.extend(distance_frame());

    let mut parser = PacketParser::new();
    parser.push(&stream);
    let mut messages = Vec::new();
    while let Decoded::Message(p) = parser.next_frame() {
        messages.push(Message::from_packet(&p).unwrap());
    }

    assert_eq!(messages.len(), 2);
    assert_eq!(parser.errors, 0);
    assert_eq!(parser.buffered_len(), 0);
}

#[test]
fn test_frame_split_across_pushes() {
    let frame = distance_frame();
    let mut parser = PacketParser::new();

    for chunk in frame.chunks(3) {
        assert!(matches!(parser.next_frame(), Decoded::NeedMoreBytes));
        parser.push(chunk);
    }
    assert!(matches!(parser.next_frame(), Decoded::Message(_)));
    assert_eq!(parser.parsed, 1);
}

#[test]
fn test_oversized_length_is_invalid() {
    let bytes = [0x42, 0x52, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00];
    let (decoded, consumed) = decode(&bytes);
    assert!(matches!(decoded, Decoded::Invalid(ProtocolError::BufferOverflow(_))));
    assert_eq!(consumed, 1);
}

#[test]
fn test_tracker_waiting_is_zero_or_one() {
    let mut tracker = RequestTracker::new(Duration::from_millis(100));
    let t0 = Instant::now();

    assert!(tracker.request(MessageId::Range, t0));
    for _ in 0..5 {
        assert!(!tracker.request(MessageId::Range, t0));
    }
    assert_eq!(tracker.status(MessageId::Range).unwrap().waiting, 1);

    assert_eq!(tracker.on_ack(MessageId::Range), ReplyMatch::Matched);
    assert_eq!(tracker.on_ack(MessageId::Range), ReplyMatch::Unsolicited);
    let status = tracker.status(MessageId::Range).unwrap();
    assert_eq!(status.waiting, 0);
    assert_eq!(status.ack, 1);
}

#[test]
fn test_lost_messages_only_count_timeouts() {
    let mut tracker = RequestTracker::new(Duration::from_millis(100));
    let t0 = Instant::now();

    tracker.request(MessageId::Voltage5, t0);
    tracker.on_nack(MessageId::Voltage5);
    assert_eq!(tracker.lost_messages(), 0);

    tracker.request(MessageId::Voltage5, t0);
    assert!(tracker.expire(t0 + Duration::from_millis(99)).is_empty());
    assert_eq!(tracker.expire(t0 + Duration::from_millis(100)), vec![MessageId::Voltage5]);
    assert_eq!(tracker.lost_messages(), 1);

    let status = tracker.status(MessageId::Voltage5).unwrap();
    assert_eq!(status.nack, 2);
    assert_eq!(status.waiting, 0);
}
