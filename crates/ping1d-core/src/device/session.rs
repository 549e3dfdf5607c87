//! Single-writer session task
//!
//! One tokio task owns the [`PingDevice`]. Transport bytes, API calls, the
//! poll timer and the timeout sweep all reach it through one queue, so
//! decoding and encoding never interleave.

use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{ErrorKind, Read};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{now, DeviceField, DeviceState, PingDevice, Poller};
use crate::config::EngineConfig;
use crate::protocol::{CommunicationChannel, MessageId, ProtocolError, RequestStatus};
use crate::settings::{
    ApplyReport, ConfigurationSynchronizer, Parameter, ParameterTarget, SettingsStore,
};

const COMMAND_QUEUE_DEPTH: usize = 256;
const READ_CHUNK: usize = 1024;

/// Point-in-time copy of everything observable about the session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: DeviceState,
    pub requests: BTreeMap<MessageId, RequestStatus>,
    pub parser_errors: u32,
    pub parsed_messages: u32,
    pub lost_messages: u32,
}

impl SessionSnapshot {
    fn capture(device: &PingDevice) -> Self {
        Self {
            state: device.state().clone(),
            requests: device.tracker().snapshot(),
            parser_errors: device.parser_errors(),
            parsed_messages: device.parsed_messages(),
            lost_messages: device.lost_messages(),
        }
    }
}

enum SessionCommand {
    Bytes(Vec<u8>),
    Request(MessageId, oneshot::Sender<Result<bool, ProtocolError>>),
    SetParameter(Parameter, i64, oneshot::Sender<Result<(), ProtocolError>>),
    ApplyConfiguration(BTreeMap<String, i64>, oneshot::Sender<ApplyReport>),
    GotoBootloader(oneshot::Sender<Result<(), ProtocolError>>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown,
}

/// Map a state field back to the parameter it persists, if any
fn parameter_for(field: DeviceField) -> Option<Parameter> {
    match field {
        DeviceField::PingInterval => Some(Parameter::PingInterval),
        DeviceField::SpeedOfSound => Some(Parameter::SpeedOfSound),
        DeviceField::ModeAuto => Some(Parameter::AutomaticMode),
        DeviceField::GainIndex => Some(Parameter::GainIndex),
        DeviceField::ScanLength => Some(Parameter::LengthDistance),
        DeviceField::ScanStart => Some(Parameter::StartDistance),
        _ => None,
    }
}

/// Session builder and event loop
pub struct Session {
    device: PingDevice,
    config: EngineConfig,
    poller: Poller,
    sync: ConfigurationSynchronizer,
    store: Option<Box<dyn SettingsStore>>,
    persisted: BTreeMap<String, i64>,
}

impl Session {
    pub fn new(device: PingDevice, config: EngineConfig) -> Self {
        Self {
            device,
            config,
            poller: Poller::default(),
            sync: ConfigurationSynchronizer::new(),
            store: None,
            persisted: BTreeMap::new(),
        }
    }

    /// Persist parameters to `store` and apply its contents on start
    pub fn with_store(mut self, store: Box<dyn SettingsStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_poller(mut self, poller: Poller) -> Self {
        self.poller = poller;
        self
    }

    /// Start the session task. The join handle yields the device back on shutdown.
    pub fn spawn(self) -> (SessionHandle, JoinHandle<PingDevice>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let task = tokio::spawn(self.run(rx));
        (SessionHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>) -> PingDevice {
        if let Some(store) = &self.store {
            match store.load() {
                Ok(values) => self.persisted = values,
                Err(e) => warn!("Could not load stored settings: {}", e),
            }
        }
        if self.config.configure_on_start {
            let persisted = self.persisted.clone();
            self.device.start_pre_configuration(&persisted, &self.sync);
        }

        let mut poll = interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let sweep_period = (self.config.request_timeout() / 4).max(Duration::from_millis(10));
        let mut sweep = interval(sweep_period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Session started");
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                _ = poll.tick() => {
                    self.poller.tick(&mut self.device, now());
                }
                _ = sweep.tick() => {
                    self.device.expire();
                }
            }
        }
        info!("Session stopped");
        self.device
    }

    fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Bytes(bytes) => {
                let changed = self.device.handle_bytes(&bytes);
                self.persist(&changed);
            }
            SessionCommand::Request(id, reply) => {
                let _ = reply.send(self.device.request(id));
            }
            SessionCommand::SetParameter(parameter, value, reply) => {
                let _ = reply.send(self.device.write_parameter(parameter, value));
            }
            SessionCommand::ApplyConfiguration(values, reply) => {
                let report = self.sync.load_and_apply(&values, &mut self.device);
                let _ = reply.send(report);
            }
            SessionCommand::GotoBootloader(reply) => {
                let _ = reply.send(self.device.goto_bootloader());
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(SessionSnapshot::capture(&self.device));
            }
            SessionCommand::Shutdown => {}
        }
    }

    /// Save parameters whose device value just changed
    fn persist(&mut self, changed: &[DeviceField]) {
        let Some(store) = self.store.as_mut() else {
            return;
        };

        let mut dirty = false;
        for parameter in changed.iter().filter_map(|f| parameter_for(*f)) {
            let key = parameter.descriptor().key.to_string();
            let value = self.device.read_parameter(parameter);
            if self.persisted.get(&key) != Some(&value) {
                self.persisted.insert(key, value);
                dirty = true;
            }
        }

        if dirty {
            debug!("Saving {} parameters", self.persisted.len());
            if let Err(e) = store.save(&self.persisted) {
                warn!("Could not save settings: {}", e);
            }
        }
    }
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, ProtocolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| ProtocolError::SessionClosed)?;
        reply_rx.await.map_err(|_| ProtocolError::SessionClosed)
    }

    /// Hand bytes received from the transport to the session
    pub async fn feed(&self, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        self.tx
            .send(SessionCommand::Bytes(bytes))
            .await
            .map_err(|_| ProtocolError::SessionClosed)
    }

    /// [`SessionHandle::feed`] for transport threads outside the runtime
    pub fn feed_blocking(&self, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        self.tx
            .blocking_send(SessionCommand::Bytes(bytes))
            .map_err(|_| ProtocolError::SessionClosed)
    }

    /// Request a message id; `Ok(false)` if one was already in flight
    pub async fn request(&self, id: MessageId) -> Result<bool, ProtocolError> {
        self.call(|tx| SessionCommand::Request(id, tx)).await?
    }

    pub async fn set_parameter(&self, parameter: Parameter, value: i64) -> Result<(), ProtocolError> {
        self.call(|tx| SessionCommand::SetParameter(parameter, value, tx))
            .await?
    }

    pub async fn apply_configuration(
        &self,
        values: BTreeMap<String, i64>,
    ) -> Result<ApplyReport, ProtocolError> {
        self.call(|tx| SessionCommand::ApplyConfiguration(values, tx))
            .await
    }

    pub async fn goto_bootloader(&self) -> Result<(), ProtocolError> {
        self.call(SessionCommand::GotoBootloader).await?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, ProtocolError> {
        self.call(SessionCommand::Snapshot).await
    }

    /// Stop the session; the transport is released when the task returns
    pub async fn shutdown(&self) {
        let _ = self.tx.send(SessionCommand::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Pump bytes from `channel` into the session on a blocking thread.
///
/// Ends when the channel fails or the session goes away.
pub fn spawn_reader(mut channel: Box<dyn CommunicationChannel>, handle: SessionHandle) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let name = channel.describe();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match channel.read(&mut buf) {
                Ok(0) => {
                    info!("{} closed", name);
                    break;
                }
                Ok(n) => {
                    if handle.feed_blocking(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    if handle.is_closed() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("Read from {} failed: {}", name, e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use crate::settings::MemoryStore;
    use crate::testutil::SharedBuffer;

    fn quiet_config() -> EngineConfig {
        EngineConfig {
            configure_on_start: false,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_updates_snapshot() {
        let link = SharedBuffer::default();
        let device = PingDevice::new(Box::new(link.clone()), Duration::from_secs(1));
        let (handle, task) = Session::new(device, quiet_config()).spawn();

        handle
            .feed(Message::DistanceSimple { distance: 2500, confidence: 90 }.encode())
            .await
            .unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state.distance, 2500);
        assert_eq!(snapshot.parsed_messages, 1);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_polls_become_lost() {
        let link = SharedBuffer::default();
        let device = PingDevice::new(Box::new(link.clone()), Duration::from_millis(500));
        let (handle, task) = Session::new(device, quiet_config())
            .with_poller(Poller::new(vec![MessageId::Voltage5]))
            .spawn();

        // First poll fires immediately, times out after 500 ms; next poll at 1 s
        tokio::time::sleep(Duration::from_millis(900)).await;
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.lost_messages, 1);
        assert_eq!(snapshot.requests[&MessageId::Voltage5].nack, 1);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_parameter_is_persisted() {
        let link = SharedBuffer::default();
        let device = PingDevice::new(Box::new(link.clone()), Duration::from_secs(1));
        let store = MemoryStore::default();
        let (handle, task) = Session::new(device, quiet_config())
            .with_store(Box::new(store.clone()))
            .spawn();

        handle.set_parameter(Parameter::GainIndex, 4).await.unwrap();
        handle
            .feed(Message::GainIndex { gain_index: 4 }.encode())
            .await
            .unwrap();
        handle.snapshot().await.unwrap();

        assert_eq!(store.load().unwrap().get("3_gainIndex"), Some(&4));

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_session_reports_error() {
        let device = PingDevice::new(Box::new(SharedBuffer::default()), Duration::from_secs(1));
        let (handle, task) = Session::new(device, quiet_config()).spawn();
        handle.shutdown().await;
        task.await.unwrap();

        assert!(matches!(
            handle.request(MessageId::Range).await,
            Err(ProtocolError::SessionClosed)
        ));
    }
}
