//! Last-known sonar values
//!
//! [`DeviceState`] is only ever written by [`DeviceState::apply`] with a
//! checksum-valid incoming message.

use serde::{Deserialize, Serialize};

use crate::protocol::messages::DistanceReport;
use crate::protocol::Message;

/// Fields of [`DeviceState`], used in change notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceField {
    SrcId,
    DstId,
    DeviceType,
    DeviceModel,
    FirmwareVersionMajor,
    FirmwareVersionMinor,
    DeviceId,
    Distance,
    Confidence,
    PulseDuration,
    PingNumber,
    ScanStart,
    ScanLength,
    GainIndex,
    Points,
    ModeAuto,
    PingInterval,
    SpeedOfSound,
    ProcessorTemperature,
    PcbTemperature,
    BoardVoltage,
    PingEnable,
    AsciiText,
    ErrMsg,
}

/// The sensor's last reported values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub src_id: u8,
    pub dst_id: u8,
    pub device_id: u8,
    pub device_type: u8,
    pub device_model: u8,
    pub firmware_version_major: u16,
    pub firmware_version_minor: u16,

    /// mm
    pub distance: u32,
    /// 0-100 %
    pub confidence: u16,
    /// µs
    pub pulse_duration: u16,
    pub ping_number: u32,
    /// mm
    pub scan_start: u32,
    /// mm
    pub scan_length: u32,
    pub gain_index: u32,
    /// Echo strength normalised to `0.0..=1.0`
    pub points: Vec<f64>,

    pub mode_auto: bool,
    /// ms
    pub ping_interval: u16,
    /// mm/s
    pub speed_of_sound: u32,

    /// centi-°C
    pub processor_temperature: u16,
    /// centi-°C
    pub pcb_temperature: u16,
    /// mV
    pub board_voltage: u16,

    pub ping_enabled: bool,

    pub ascii_text: String,
    pub err_msg: String,
}

fn update<T: PartialEq>(slot: &mut T, value: T, field: DeviceField, changed: &mut Vec<DeviceField>) {
    if *slot != value {
        *slot = value;
        changed.push(field);
    }
}

impl DeviceState {
    /// Fold an incoming message into the state, returning the fields that changed
    pub fn apply(&mut self, message: &Message) -> Vec<DeviceField> {
        let mut changed = Vec::new();
        let c = &mut changed;
        match message {
            Message::Nack { message, .. } => {
                update(&mut self.err_msg, message.clone(), DeviceField::ErrMsg, c)
            }
            Message::AsciiText { message } => {
                update(&mut self.ascii_text, message.clone(), DeviceField::AsciiText, c)
            }
            Message::FirmwareVersion {
                device_type,
                device_model,
                firmware_version_major,
                firmware_version_minor,
            } => {
                update(&mut self.device_type, *device_type, DeviceField::DeviceType, c);
                update(&mut self.device_model, *device_model, DeviceField::DeviceModel, c);
                self.apply_version(*firmware_version_major, *firmware_version_minor, c);
            }
            Message::DeviceId { device_id } => {
                update(&mut self.device_id, *device_id, DeviceField::DeviceId, c)
            }
            Message::Voltage5 { voltage_5 } => {
                update(&mut self.board_voltage, *voltage_5, DeviceField::BoardVoltage, c)
            }
            Message::SpeedOfSound { speed_of_sound } => {
                update(&mut self.speed_of_sound, *speed_of_sound, DeviceField::SpeedOfSound, c)
            }
            Message::Range {
                scan_start,
                scan_length,
            } => {
                update(&mut self.scan_start, *scan_start, DeviceField::ScanStart, c);
                update(&mut self.scan_length, *scan_length, DeviceField::ScanLength, c);
            }
            Message::ModeAuto { mode_auto } => {
                update(&mut self.mode_auto, *mode_auto, DeviceField::ModeAuto, c)
            }
            Message::PingInterval { ping_interval } => {
                update(&mut self.ping_interval, *ping_interval, DeviceField::PingInterval, c)
            }
            Message::GainIndex { gain_index } => {
                update(&mut self.gain_index, *gain_index, DeviceField::GainIndex, c)
            }
            Message::PulseDuration { pulse_duration } => {
                update(&mut self.pulse_duration, *pulse_duration, DeviceField::PulseDuration, c)
            }
            Message::GeneralInfo {
                firmware_version_major,
                firmware_version_minor,
                voltage_5,
                ping_interval,
                gain_index,
                mode_auto,
            } => {
                self.apply_version(*firmware_version_major, *firmware_version_minor, c);
                update(&mut self.board_voltage, *voltage_5, DeviceField::BoardVoltage, c);
                update(&mut self.ping_interval, *ping_interval, DeviceField::PingInterval, c);
                update(&mut self.gain_index, u32::from(*gain_index), DeviceField::GainIndex, c);
                update(&mut self.mode_auto, *mode_auto, DeviceField::ModeAuto, c);
            }
            Message::DistanceSimple {
                distance,
                confidence,
            } => {
                update(&mut self.distance, *distance, DeviceField::Distance, c);
                update(&mut self.confidence, u16::from(*confidence), DeviceField::Confidence, c);
            }
            Message::Distance(report) => self.apply_report(report, c),
            Message::ProcessorTemperature { temperature } => update(
                &mut self.processor_temperature,
                *temperature,
                DeviceField::ProcessorTemperature,
                c,
            ),
            Message::PcbTemperature { temperature } => {
                update(&mut self.pcb_temperature, *temperature, DeviceField::PcbTemperature, c)
            }
            Message::PingEnable { ping_enabled } => {
                update(&mut self.ping_enabled, *ping_enabled, DeviceField::PingEnable, c)
            }
            Message::Profile {
                report,
                profile_data,
            } => {
                self.apply_report(report, c);
                let points = profile_data.iter().map(|b| f64::from(*b) / 255.0).collect();
                update(&mut self.points, points, DeviceField::Points, c);
            }
            // Acks, requests, and host-to-device commands carry no device state
            Message::Ack { .. }
            | Message::GeneralRequest { .. }
            | Message::SetDeviceId { .. }
            | Message::SetRange { .. }
            | Message::SetSpeedOfSound { .. }
            | Message::SetModeAuto { .. }
            | Message::SetPingInterval { .. }
            | Message::SetGainIndex { .. }
            | Message::SetPingEnable { .. }
            | Message::GotoBootloader
            | Message::ContinuousStart { .. }
            | Message::ContinuousStop { .. } => {}
        }
        changed
    }

    /// Record the frame routing ids
    pub fn apply_route(&mut self, src_id: u8, dst_id: u8) -> Vec<DeviceField> {
        let mut changed = Vec::new();
        update(&mut self.src_id, src_id, DeviceField::SrcId, &mut changed);
        update(&mut self.dst_id, dst_id, DeviceField::DstId, &mut changed);
        changed
    }

    /// Pings per second implied by the current ping interval
    pub fn ping_frequency(&self) -> f32 {
        if self.ping_interval == 0 {
            0.0
        } else {
            1000.0 / f32::from(self.ping_interval)
        }
    }

    fn apply_version(&mut self, major: u16, minor: u16, c: &mut Vec<DeviceField>) {
        update(&mut self.firmware_version_major, major, DeviceField::FirmwareVersionMajor, c);
        update(&mut self.firmware_version_minor, minor, DeviceField::FirmwareVersionMinor, c);
    }

    fn apply_report(&mut self, report: &DistanceReport, c: &mut Vec<DeviceField>) {
        update(&mut self.distance, report.distance, DeviceField::Distance, c);
        update(&mut self.confidence, report.confidence, DeviceField::Confidence, c);
        update(&mut self.pulse_duration, report.transmit_duration, DeviceField::PulseDuration, c);
        update(&mut self.ping_number, report.ping_number, DeviceField::PingNumber, c);
        update(&mut self.scan_start, report.scan_start, DeviceField::ScanStart, c);
        update(&mut self.scan_length, report.scan_length, DeviceField::ScanLength, c);
        update(&mut self.gain_index, report.gain_setting, DeviceField::GainIndex, c);
    }
}
