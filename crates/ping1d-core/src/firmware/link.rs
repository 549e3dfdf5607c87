//! Getting the device into its serial bootloader

use std::io::Write;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::config::FirmwareConfig;
use crate::device::SessionHandle;
use crate::protocol::{open_port, Message, ProtocolError, DEFAULT_BAUD_RATE};

const PROBE_PERIOD: Duration = Duration::from_millis(200);

/// Link control used by the updater before flashing
#[allow(async_fn_in_trait)]
pub trait BootloaderLink {
    /// Tell the running firmware to reboot into the bootloader
    async fn goto_bootloader(&mut self) -> Result<(), ProtocolError>;

    /// Wait until the port is usable at the bootloader baud rate
    async fn await_bootloader(&mut self, baud: u32) -> Result<(), ProtocolError>;
}

/// [`BootloaderLink`] over a local serial port
pub struct SerialBootloaderLink {
    port: String,
    session: Option<SessionHandle>,
    settle: Duration,
    reconnect_timeout: Duration,
}

impl SerialBootloaderLink {
    pub fn new(port: impl Into<String>, config: &FirmwareConfig) -> Self {
        Self {
            port: port.into(),
            session: None,
            settle: config.settle(),
            reconnect_timeout: config.reconnect_timeout(),
        }
    }

    /// Route the bootloader command through a running session, which is
    /// then shut down to release the port
    pub fn with_session(mut self, session: SessionHandle) -> Self {
        self.session = Some(session);
        self
    }

    async fn probe(&self, baud: u32) -> Result<(), ProtocolError> {
        let port = self.port.clone();
        tokio::task::spawn_blocking(move || open_port(&port, Some(baud)).map(drop))
            .await
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?
    }
}

impl BootloaderLink for SerialBootloaderLink {
    async fn goto_bootloader(&mut self) -> Result<(), ProtocolError> {
        if let Some(session) = self.session.take() {
            session.goto_bootloader().await?;
            session.shutdown().await;
            return Ok(());
        }

        let port = self.port.clone();
        tokio::task::spawn_blocking(move || -> Result<(), ProtocolError> {
            let mut serial = open_port(&port, Some(DEFAULT_BAUD_RATE))?;
            serial.write_all(&Message::GotoBootloader.encode())?;
            serial.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?
    }

    async fn await_bootloader(&mut self, baud: u32) -> Result<(), ProtocolError> {
        sleep(self.settle).await;

        let deadline = Instant::now() + self.reconnect_timeout;
        loop {
            match self.probe(baud).await {
                Ok(()) => {
                    info!("{} is back at {} baud", self.port, baud);
                    return Ok(());
                }
                Err(e) if Instant::now() >= deadline => {
                    debug!("Giving up on {}: {}", self.port, e);
                    return Err(e);
                }
                Err(_) => sleep(PROBE_PERIOD).await,
            }
        }
    }
}
