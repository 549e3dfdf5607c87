//! Protocol messages
//!
//! Defines the message catalogue of the Ping1D protocol and converts between
//! typed messages and checksum-valid [`Packet`]s.

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};

use super::{Packet, PacketBuilder, ProtocolError};

/// Message identifiers understood by Ping1D devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum MessageId {
    Ack = 1,
    Nack = 2,
    AsciiText = 3,
    GeneralRequest = 6,

    SetDeviceId = 1000,
    SetRange = 1001,
    SetSpeedOfSound = 1002,
    SetModeAuto = 1003,
    SetPingInterval = 1004,
    SetGainIndex = 1005,
    SetPingEnable = 1006,

    GotoBootloader = 1100,

    FirmwareVersion = 1200,
    DeviceId = 1201,
    Voltage5 = 1202,
    SpeedOfSound = 1203,
    Range = 1204,
    ModeAuto = 1205,
    PingInterval = 1206,
    GainIndex = 1207,
    PulseDuration = 1208,
    GeneralInfo = 1210,
    DistanceSimple = 1211,
    Distance = 1212,
    ProcessorTemperature = 1213,
    PcbTemperature = 1214,
    PingEnable = 1215,

    Profile = 1300,

    ContinuousStart = 1400,
    ContinuousStop = 1401,
}

impl MessageId {
    /// Every id in the catalogue
    pub const ALL: [MessageId; 30] = [
        MessageId::Ack,
        MessageId::Nack,
        MessageId::AsciiText,
        MessageId::GeneralRequest,
        MessageId::SetDeviceId,
        MessageId::SetRange,
        MessageId::SetSpeedOfSound,
        MessageId::SetModeAuto,
        MessageId::SetPingInterval,
        MessageId::SetGainIndex,
        MessageId::SetPingEnable,
        MessageId::GotoBootloader,
        MessageId::FirmwareVersion,
        MessageId::DeviceId,
        MessageId::Voltage5,
        MessageId::SpeedOfSound,
        MessageId::Range,
        MessageId::ModeAuto,
        MessageId::PingInterval,
        MessageId::GainIndex,
        MessageId::PulseDuration,
        MessageId::GeneralInfo,
        MessageId::DistanceSimple,
        MessageId::Distance,
        MessageId::ProcessorTemperature,
        MessageId::PcbTemperature,
        MessageId::PingEnable,
        MessageId::Profile,
        MessageId::ContinuousStart,
        MessageId::ContinuousStop,
    ];

    /// Look up an id from its wire value
    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|id| *id as u16 == value)
    }

    /// Wire value of this id
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// A decoded, typed protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Ack {
        acked_id: u16,
    },
    Nack {
        nacked_id: u16,
        message: String,
    },
    AsciiText {
        message: String,
    },
    GeneralRequest {
        requested_id: u16,
    },

    SetDeviceId {
        device_id: u8,
    },
    SetRange {
        scan_start: u32,
        scan_length: u32,
    },
    SetSpeedOfSound {
        speed_of_sound: u32,
    },
    SetModeAuto {
        mode_auto: bool,
    },
    SetPingInterval {
        ping_interval: u16,
    },
    SetGainIndex {
        gain_index: u8,
    },
    SetPingEnable {
        ping_enabled: bool,
    },

    GotoBootloader,

    FirmwareVersion {
        device_type: u8,
        device_model: u8,
        firmware_version_major: u16,
        firmware_version_minor: u16,
    },
    DeviceId {
        device_id: u8,
    },
    Voltage5 {
        voltage_5: u16,
    },
    SpeedOfSound {
        speed_of_sound: u32,
    },
    Range {
        scan_start: u32,
        scan_length: u32,
    },
    ModeAuto {
        mode_auto: bool,
    },
    PingInterval {
        ping_interval: u16,
    },
    GainIndex {
        gain_index: u32,
    },
    PulseDuration {
        pulse_duration: u16,
    },
    GeneralInfo {
        firmware_version_major: u16,
        firmware_version_minor: u16,
        voltage_5: u16,
        ping_interval: u16,
        gain_index: u8,
        mode_auto: bool,
    },
    DistanceSimple {
        distance: u32,
        confidence: u8,
    },
    Distance(DistanceReport),
    ProcessorTemperature {
        temperature: u16,
    },
    PcbTemperature {
        temperature: u16,
    },
    PingEnable {
        ping_enabled: bool,
    },

    Profile {
        report: DistanceReport,
        profile_data: Vec<u8>,
    },

    ContinuousStart {
        id: u16,
    },
    ContinuousStop {
        id: u16,
    },
}

/// Measurement block shared by `distance` and `profile` messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistanceReport {
    /// Distance to target (mm)
    pub distance: u32,
    /// Confidence in the distance (0-100 %)
    pub confidence: u16,
    /// Acoustic pulse duration (µs)
    pub transmit_duration: u16,
    /// Pings since boot
    pub ping_number: u32,
    /// Start of the scan window (mm)
    pub scan_start: u32,
    /// Length of the scan window (mm)
    pub scan_length: u32,
    /// Current gain setting
    pub gain_setting: u32,
}

impl DistanceReport {
    fn read(r: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(Self {
            distance: r.read_u32::<LittleEndian>()?,
            confidence: r.read_u16::<LittleEndian>()?,
            transmit_duration: r.read_u16::<LittleEndian>()?,
            ping_number: r.read_u32::<LittleEndian>()?,
            scan_start: r.read_u32::<LittleEndian>()?,
            scan_length: r.read_u32::<LittleEndian>()?,
            gain_setting: r.read_u32::<LittleEndian>()?,
        })
    }

    fn write(&self, builder: PacketBuilder) -> PacketBuilder {
        builder
            .u32_le(self.distance)
            .u16_le(self.confidence)
            .u16_le(self.transmit_duration)
            .u32_le(self.ping_number)
            .u32_le(self.scan_start)
            .u32_le(self.scan_length)
            .u32_le(self.gain_setting)
    }
}

impl Message {
    /// Get the message id
    pub fn id(&self) -> MessageId {
        match self {
            Message::Ack { .. } => MessageId::Ack,
            Message::Nack { .. } => MessageId::Nack,
            Message::AsciiText { .. } => MessageId::AsciiText,
            Message::GeneralRequest { .. } => MessageId::GeneralRequest,
            Message::SetDeviceId { .. } => MessageId::SetDeviceId,
            Message::SetRange { .. } => MessageId::SetRange,
            Message::SetSpeedOfSound { .. } => MessageId::SetSpeedOfSound,
            Message::SetModeAuto { .. } => MessageId::SetModeAuto,
            Message::SetPingInterval { .. } => MessageId::SetPingInterval,
            Message::SetGainIndex { .. } => MessageId::SetGainIndex,
            Message::SetPingEnable { .. } => MessageId::SetPingEnable,
            Message::GotoBootloader => MessageId::GotoBootloader,
            Message::FirmwareVersion { .. } => MessageId::FirmwareVersion,
            Message::DeviceId { .. } => MessageId::DeviceId,
            Message::Voltage5 { .. } => MessageId::Voltage5,
            Message::SpeedOfSound { .. } => MessageId::SpeedOfSound,
            Message::Range { .. } => MessageId::Range,
            Message::ModeAuto { .. } => MessageId::ModeAuto,
            Message::PingInterval { .. } => MessageId::PingInterval,
            Message::GainIndex { .. } => MessageId::GainIndex,
            Message::PulseDuration { .. } => MessageId::PulseDuration,
            Message::GeneralInfo { .. } => MessageId::GeneralInfo,
            Message::DistanceSimple { .. } => MessageId::DistanceSimple,
            Message::Distance(_) => MessageId::Distance,
            Message::ProcessorTemperature { .. } => MessageId::ProcessorTemperature,
            Message::PcbTemperature { .. } => MessageId::PcbTemperature,
            Message::PingEnable { .. } => MessageId::PingEnable,
            Message::Profile { .. } => MessageId::Profile,
            Message::ContinuousStart { .. } => MessageId::ContinuousStart,
            Message::ContinuousStop { .. } => MessageId::ContinuousStop,
        }
    }

    /// Encode into a packet addressed from `src` to `dst`
    pub fn to_packet(&self, src_device_id: u8, dst_device_id: u8) -> Packet {
        let b = PacketBuilder::new(self.id().as_u16()).route(src_device_id, dst_device_id);
        let b = match self {
            Message::Ack { acked_id } => b.u16_le(*acked_id),
            Message::Nack { nacked_id, message } => {
                b.u16_le(*nacked_id).bytes(message.as_bytes()).u8(0)
            }
            Message::AsciiText { message } => b.bytes(message.as_bytes()).u8(0),
            Message::GeneralRequest { requested_id } => b.u16_le(*requested_id),
            Message::SetDeviceId { device_id } | Message::DeviceId { device_id } => {
                b.u8(*device_id)
            }
            Message::SetRange {
                scan_start,
                scan_length,
            }
            | Message::Range {
                scan_start,
                scan_length,
            } => b.u32_le(*scan_start).u32_le(*scan_length),
            Message::SetSpeedOfSound { speed_of_sound }
            | Message::SpeedOfSound { speed_of_sound } => b.u32_le(*speed_of_sound),
            Message::SetModeAuto { mode_auto } | Message::ModeAuto { mode_auto } => {
                b.u8(u8::from(*mode_auto))
            }
            Message::SetPingInterval { ping_interval }
            | Message::PingInterval { ping_interval } => b.u16_le(*ping_interval),
            Message::SetGainIndex { gain_index } => b.u8(*gain_index),
            Message::SetPingEnable { ping_enabled } | Message::PingEnable { ping_enabled } => {
                b.u8(u8::from(*ping_enabled))
            }
            Message::GotoBootloader => b,
            Message::FirmwareVersion {
                device_type,
                device_model,
                firmware_version_major,
                firmware_version_minor,
            } => b
                .u8(*device_type)
                .u8(*device_model)
                .u16_le(*firmware_version_major)
                .u16_le(*firmware_version_minor),
            Message::Voltage5 { voltage_5 } => b.u16_le(*voltage_5),
            Message::GainIndex { gain_index } => b.u32_le(*gain_index),
            Message::PulseDuration { pulse_duration } => b.u16_le(*pulse_duration),
            Message::GeneralInfo {
                firmware_version_major,
                firmware_version_minor,
                voltage_5,
                ping_interval,
                gain_index,
                mode_auto,
            } => b
                .u16_le(*firmware_version_major)
                .u16_le(*firmware_version_minor)
                .u16_le(*voltage_5)
                .u16_le(*ping_interval)
                .u8(*gain_index)
                .u8(u8::from(*mode_auto)),
            Message::DistanceSimple {
                distance,
                confidence,
            } => b.u32_le(*distance).u8(*confidence),
            Message::Distance(report) => report.write(b),
            Message::ProcessorTemperature { temperature }
            | Message::PcbTemperature { temperature } => b.u16_le(*temperature),
            Message::Profile {
                report,
                profile_data,
            } => report
                .write(b)
                .u16_le(profile_data.len() as u16)
                .bytes(profile_data),
            Message::ContinuousStart { id } | Message::ContinuousStop { id } => b.u16_le(*id),
        };
        b.build()
    }

    /// Encode straight to wire bytes (unaddressed)
    pub fn encode(&self) -> Vec<u8> {
        self.to_packet(0, 0).to_bytes()
    }

    /// Decode a checksum-valid packet into a typed message
    pub fn from_packet(packet: &Packet) -> Result<Self, ProtocolError> {
        let id = MessageId::from_u16(packet.message_id)
            .ok_or(ProtocolError::UnknownMessage(packet.message_id))?;
        let mut r = Cursor::new(packet.payload.as_slice());
        Self::read_payload(id, &mut r).map_err(|e| {
            ProtocolError::MalformedFrame(format!(
                "{:?} payload of {} bytes: {}",
                id,
                packet.payload.len(),
                e
            ))
        })
    }

    fn read_payload(id: MessageId, r: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        let msg = match id {
            MessageId::Ack => Message::Ack {
                acked_id: r.read_u16::<LittleEndian>()?,
            },
            MessageId::Nack => Message::Nack {
                nacked_id: r.read_u16::<LittleEndian>()?,
                message: read_text(r)?,
            },
            MessageId::AsciiText => Message::AsciiText {
                message: read_text(r)?,
            },
            MessageId::GeneralRequest => Message::GeneralRequest {
                requested_id: r.read_u16::<LittleEndian>()?,
            },
            MessageId::SetDeviceId => Message::SetDeviceId {
                device_id: r.read_u8()?,
            },
            MessageId::SetRange => Message::SetRange {
                scan_start: r.read_u32::<LittleEndian>()?,
                scan_length: r.read_u32::<LittleEndian>()?,
            },
            MessageId::SetSpeedOfSound => Message::SetSpeedOfSound {
                speed_of_sound: r.read_u32::<LittleEndian>()?,
            },
            MessageId::SetModeAuto => Message::SetModeAuto {
                mode_auto: r.read_u8()? != 0,
            },
            MessageId::SetPingInterval => Message::SetPingInterval {
                ping_interval: r.read_u16::<LittleEndian>()?,
            },
            MessageId::SetGainIndex => Message::SetGainIndex {
                gain_index: r.read_u8()?,
            },
            MessageId::SetPingEnable => Message::SetPingEnable {
                ping_enabled: r.read_u8()? != 0,
            },
            MessageId::GotoBootloader => Message::GotoBootloader,
            MessageId::FirmwareVersion => Message::FirmwareVersion {
                device_type: r.read_u8()?,
                device_model: r.read_u8()?,
                firmware_version_major: r.read_u16::<LittleEndian>()?,
                firmware_version_minor: r.read_u16::<LittleEndian>()?,
            },
            MessageId::DeviceId => Message::DeviceId {
                device_id: r.read_u8()?,
            },
            MessageId::Voltage5 => Message::Voltage5 {
                voltage_5: r.read_u16::<LittleEndian>()?,
            },
            MessageId::SpeedOfSound => Message::SpeedOfSound {
                speed_of_sound: r.read_u32::<LittleEndian>()?,
            },
            MessageId::Range => Message::Range {
                scan_start: r.read_u32::<LittleEndian>()?,
                scan_length: r.read_u32::<LittleEndian>()?,
            },
            MessageId::ModeAuto => Message::ModeAuto {
                mode_auto: r.read_u8()? != 0,
            },
            MessageId::PingInterval => Message::PingInterval {
                ping_interval: r.read_u16::<LittleEndian>()?,
            },
            MessageId::GainIndex => Message::GainIndex {
                gain_index: r.read_u32::<LittleEndian>()?,
            },
            MessageId::PulseDuration => Message::PulseDuration {
                pulse_duration: r.read_u16::<LittleEndian>()?,
            },
            MessageId::GeneralInfo => Message::GeneralInfo {
                firmware_version_major: r.read_u16::<LittleEndian>()?,
                firmware_version_minor: r.read_u16::<LittleEndian>()?,
                voltage_5: r.read_u16::<LittleEndian>()?,
                ping_interval: r.read_u16::<LittleEndian>()?,
                gain_index: r.read_u8()?,
                mode_auto: r.read_u8()? != 0,
            },
            MessageId::DistanceSimple => Message::DistanceSimple {
                distance: r.read_u32::<LittleEndian>()?,
                confidence: r.read_u8()?,
            },
            MessageId::Distance => Message::Distance(DistanceReport::read(r)?),
            MessageId::ProcessorTemperature => Message::ProcessorTemperature {
                temperature: r.read_u16::<LittleEndian>()?,
            },
            MessageId::PcbTemperature => Message::PcbTemperature {
                temperature: r.read_u16::<LittleEndian>()?,
            },
            MessageId::PingEnable => Message::PingEnable {
                ping_enabled: r.read_u8()? != 0,
            },
            MessageId::Profile => {
                let report = DistanceReport::read(r)?;
                let len = r.read_u16::<LittleEndian>()? as usize;
                let mut profile_data = vec![0u8; len];
                r.read_exact(&mut profile_data)?;
                Message::Profile {
                    report,
                    profile_data,
                }
            }
            MessageId::ContinuousStart => Message::ContinuousStart {
                id: r.read_u16::<LittleEndian>()?,
            },
            MessageId::ContinuousStop => Message::ContinuousStop {
                id: r.read_u16::<LittleEndian>()?,
            },
        };
        Ok(msg)
    }
}

/// Read a null-terminated (or payload-terminated) ASCII string
fn read_text(r: &mut Cursor<&[u8]>) -> std::io::Result<String> {
    let mut rest = Vec::new();
    r.read_to_end(&mut rest)?;
    let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
    Ok(String::from_utf8_lossy(&rest[..end]).into_owned())
}
