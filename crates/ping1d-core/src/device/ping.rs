//! The Ping1D protocol engine

use std::collections::BTreeMap;
use std::io::Write;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::{now, DeviceEvent, DeviceField, DeviceObserver, DeviceState, PING_MAX_FREQUENCY};
use crate::protocol::{
    Decoded, Message, MessageId, Packet, PacketParser, ProtocolError, ReplyMatch, RequestTracker,
    MAX_PAYLOAD_SIZE,
};
use crate::settings::{ApplyReport, ConfigurationSynchronizer, Parameter, ParameterTarget};

/// Protocol engine for one sonar.
///
/// Incoming bytes go through [`PingDevice::handle_bytes`]; commands are
/// encoded, written to the link, and followed by a tracked request for the
/// id that confirms them.
pub struct PingDevice {
    link: Box<dyn Write + Send>,
    parser: PacketParser,
    tracker: RequestTracker,
    state: DeviceState,
    /// Range sent but not yet confirmed, so start/length edits compose
    commanded_range: Option<(u32, u32)>,
    src_device_id: u8,
    dst_device_id: u8,
    observers: Vec<DeviceObserver>,
}

impl PingDevice {
    /// Create an engine writing to `link`, with the given reply window
    pub fn new(link: Box<dyn Write + Send>, request_timeout: Duration) -> Self {
        Self {
            link,
            parser: PacketParser::new(),
            tracker: RequestTracker::new(request_timeout),
            state: DeviceState::default(),
            commanded_range: None,
            src_device_id: 0,
            dst_device_id: 0,
            observers: Vec::new(),
        }
    }

    /// Register an observer for state and counter changes
    pub fn subscribe(&mut self, observer: impl Fn(&DeviceEvent) + Send + Sync + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Last-known device values
    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Request counters
    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    /// Frames dropped by the parser
    pub fn parser_errors(&self) -> u32 {
        self.parser.errors
    }

    /// Frames decoded successfully
    pub fn parsed_messages(&self) -> u32 {
        self.parser.parsed
    }

    /// Requests that went unanswered
    pub fn lost_messages(&self) -> u32 {
        self.tracker.lost_messages()
    }

    fn notify(&self, event: DeviceEvent) {
        for observer in &self.observers {
            observer(&event);
        }
    }

    // ------------------------------------------------------------------
    // Incoming
    // ------------------------------------------------------------------

    /// Feed bytes received from the transport; frames are handled in order.
    ///
    /// Returns the state fields that changed.
    pub fn handle_bytes(&mut self, data: &[u8]) -> Vec<DeviceField> {
        let mut changed = Vec::new();
        self.parser.push(data);
        loop {
            match self.parser.next_frame() {
                Decoded::Message(packet) => changed.extend(self.handle_packet(packet)),
                Decoded::Invalid(e) => {
                    debug!("Dropped byte while resynchronizing: {}", e);
                    self.notify(DeviceEvent::ParserErrorsChanged(self.parser.errors));
                }
                Decoded::NeedMoreBytes => break,
            }
        }
        changed
    }

    fn handle_packet(&mut self, packet: Packet) -> Vec<DeviceField> {
        let message = match Message::from_packet(&packet) {
            Ok(m) => m,
            Err(e) => {
                warn!("Discarding frame {}: {}", packet.message_id, e);
                self.parser.errors += 1;
                self.notify(DeviceEvent::ParserErrorsChanged(self.parser.errors));
                return Vec::new();
            }
        };
        trace!("Received {:?}", message);

        let mut changed = self
            .state
            .apply_route(packet.src_device_id, packet.dst_device_id);

        let matched = match &message {
            Message::Ack { acked_id } => MessageId::from_u16(*acked_id)
                .map(|id| self.tracker.on_ack(id))
                .unwrap_or(ReplyMatch::Unsolicited),
            Message::Nack { nacked_id, message: text } => {
                warn!("Device rejected message {}: {}", nacked_id, text);
                MessageId::from_u16(*nacked_id)
                    .map(|id| self.tracker.on_nack(id))
                    .unwrap_or(ReplyMatch::Unsolicited)
            }
            other => self.tracker.on_ack(other.id()),
        };
        if matched == ReplyMatch::Unsolicited {
            trace!("Unsolicited {:?}", message.id());
        }

        match &message {
            Message::Range { .. } => self.commanded_range = None,
            Message::Nack { nacked_id, .. }
                if *nacked_id == MessageId::SetRange.as_u16()
                    || *nacked_id == MessageId::Range.as_u16() =>
            {
                self.commanded_range = None
            }
            _ => {}
        }

        changed.extend(self.state.apply(&message));
        for field in &changed {
            self.notify(DeviceEvent::StateChanged(*field));
        }
        changed
    }

    /// Time out requests whose window has elapsed
    pub fn expire(&mut self) -> Vec<MessageId> {
        self.expire_at(now())
    }

    /// Time out requests whose deadline is at or before `now`
    pub fn expire_at(&mut self, now: Instant) -> Vec<MessageId> {
        let base = self.tracker.lost_messages();
        let expired = self.tracker.expire(now);
        if expired.contains(&MessageId::Range) {
            // Fall back to the last reported window
            self.commanded_range = None;
        }
        for (i, id) in expired.iter().enumerate() {
            warn!("No reply to {:?} request", id);
            self.notify(DeviceEvent::LostMessagesChanged(base + i as u32 + 1));
        }
        expired
    }

    // ------------------------------------------------------------------
    // Outgoing
    // ------------------------------------------------------------------

    /// Encode and write a message to the link
    pub fn write_message(&mut self, message: &Message) -> Result<(), ProtocolError> {
        let packet = message.to_packet(self.src_device_id, self.dst_device_id);
        if packet.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::BufferOverflow(packet.payload.len()));
        }
        let bytes = packet.to_bytes();
        trace!("Sending {:?} ({} bytes)", message.id(), bytes.len());
        self.link.write_all(&bytes)?;
        self.link.flush()?;
        Ok(())
    }

    /// Request `id` from the device unless a request is already outstanding
    pub fn request(&mut self, id: MessageId) -> Result<bool, ProtocolError> {
        self.request_at(id, now())
    }

    /// [`PingDevice::request`] with an explicit clock reading.
    ///
    /// Returns `Ok(false)` when the id was already waiting and nothing was sent.
    pub fn request_at(&mut self, id: MessageId, now: Instant) -> Result<bool, ProtocolError> {
        if !self.tracker.request(id, now) {
            return Ok(false);
        }
        // A failed write stays waiting and is reaped as lost by the timeout
        self.write_message(&Message::GeneralRequest {
            requested_id: id.as_u16(),
        })?;
        Ok(true)
    }

    fn command(&mut self, message: Message, confirm: MessageId) -> Result<(), ProtocolError> {
        self.write_message(&message)?;
        self.request(confirm)?;
        Ok(())
    }

    pub fn set_device_id(&mut self, device_id: u8) -> Result<(), ProtocolError> {
        self.command(Message::SetDeviceId { device_id }, MessageId::DeviceId)
    }

    /// Set the scan window (mm)
    pub fn set_range(&mut self, scan_start: u32, scan_length: u32) -> Result<(), ProtocolError> {
        self.commanded_range = Some((scan_start, scan_length));
        self.command(
            Message::SetRange {
                scan_start,
                scan_length,
            },
            MessageId::Range,
        )
    }

    fn range_base(&self) -> (u32, u32) {
        self.commanded_range
            .unwrap_or((self.state.scan_start, self.state.scan_length))
    }

    /// Move the start of the scan window, keeping its length
    pub fn set_start_mm(&mut self, start_mm: u32) -> Result<(), ProtocolError> {
        let (_, length) = self.range_base();
        self.set_range(start_mm, length)
    }

    /// Resize the scan window, keeping its start
    pub fn set_length_mm(&mut self, length_mm: u32) -> Result<(), ProtocolError> {
        let (start, _) = self.range_base();
        self.set_range(start, length_mm)
    }

    /// Speed of sound used for time-of-flight distance (mm/s)
    pub fn set_speed_of_sound(&mut self, speed_of_sound: u32) -> Result<(), ProtocolError> {
        self.command(
            Message::SetSpeedOfSound { speed_of_sound },
            MessageId::SpeedOfSound,
        )
    }

    pub fn set_mode_auto(&mut self, mode_auto: bool) -> Result<(), ProtocolError> {
        self.command(Message::SetModeAuto { mode_auto }, MessageId::ModeAuto)
    }

    /// Time between pings (ms)
    pub fn set_ping_interval(&mut self, ping_interval: u16) -> Result<(), ProtocolError> {
        self.command(
            Message::SetPingInterval { ping_interval },
            MessageId::PingInterval,
        )
    }

    pub fn set_gain_index(&mut self, gain_index: u8) -> Result<(), ProtocolError> {
        self.command(Message::SetGainIndex { gain_index }, MessageId::GainIndex)
    }

    pub fn set_ping_enable(&mut self, ping_enabled: bool) -> Result<(), ProtocolError> {
        self.command(Message::SetPingEnable { ping_enabled }, MessageId::PingEnable)
    }

    /// Set pings per second; converted to a ping interval
    pub fn set_ping_frequency(&mut self, frequency: f32) -> Result<(), ProtocolError> {
        if !(frequency > 0.0 && frequency <= PING_MAX_FREQUENCY) {
            warn!("Invalid ping frequency: {}", frequency);
            return Err(ProtocolError::OutOfRange {
                name: "ping_frequency",
                value: frequency as i64,
            });
        }
        self.set_ping_interval((1000.0 / frequency) as u16)
    }

    /// Ask the device to stream `id` continuously
    pub fn continuous_start(&mut self, id: MessageId) -> Result<(), ProtocolError> {
        self.write_message(&Message::ContinuousStart { id: id.as_u16() })
    }

    pub fn continuous_stop(&mut self, id: MessageId) -> Result<(), ProtocolError> {
        self.write_message(&Message::ContinuousStop { id: id.as_u16() })
    }

    /// Reboot the device into its serial bootloader
    pub fn goto_bootloader(&mut self) -> Result<(), ProtocolError> {
        info!("Sending goto bootloader");
        self.write_message(&Message::GotoBootloader)
    }

    /// Session start: identify the device, apply stored settings, start profiles
    pub fn start_pre_configuration(
        &mut self,
        persisted: &BTreeMap<String, i64>,
        sync: &ConfigurationSynchronizer,
    ) -> ApplyReport {
        for id in [
            MessageId::FirmwareVersion,
            MessageId::DeviceId,
            MessageId::GeneralInfo,
        ] {
            if let Err(e) = self.request(id) {
                warn!("Initial request for {:?} failed: {}", id, e);
            }
        }

        let report = sync.load_and_apply(persisted, self);
        info!(
            "Applied {} parameters ({} defaulted, {} failed)",
            report.applied.len(),
            report.defaulted.len(),
            report.errors.len()
        );

        if let Err(e) = self.continuous_start(MessageId::Profile) {
            warn!("Could not start profile stream: {}", e);
        }
        report
    }
}

fn narrow<T: TryFrom<i64>>(parameter: Parameter, value: i64) -> Result<T, ProtocolError> {
    T::try_from(value).map_err(|_| ProtocolError::OutOfRange {
        name: parameter.descriptor().key,
        value,
    })
}

impl ParameterTarget for PingDevice {
    fn read_parameter(&self, parameter: Parameter) -> i64 {
        let s = &self.state;
        match parameter {
            Parameter::PingInterval => i64::from(s.ping_interval),
            Parameter::SpeedOfSound => i64::from(s.speed_of_sound),
            Parameter::AutomaticMode => i64::from(s.mode_auto),
            Parameter::GainIndex => i64::from(s.gain_index),
            Parameter::LengthDistance => i64::from(s.scan_length),
            Parameter::StartDistance => i64::from(s.scan_start),
        }
    }

    fn write_parameter(&mut self, parameter: Parameter, value: i64) -> Result<(), ProtocolError> {
        match parameter {
            Parameter::PingInterval => self.set_ping_interval(narrow(parameter, value)?),
            Parameter::SpeedOfSound => self.set_speed_of_sound(narrow(parameter, value)?),
            Parameter::AutomaticMode => self.set_mode_auto(value != 0),
            Parameter::GainIndex => self.set_gain_index(narrow(parameter, value)?),
            Parameter::LengthDistance => self.set_length_mm(narrow(parameter, value)?),
            Parameter::StartDistance => self.set_start_mm(narrow(parameter, value)?),
        }
    }
}
