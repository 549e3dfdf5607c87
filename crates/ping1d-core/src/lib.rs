//! # Ping1D Core Library
//!
//! Host-side engine for Blue Robotics Ping1D echosounders.
//!
//! This library provides:
//! - Ping protocol framing, streaming decode and the message catalogue
//! - Request tracking with per-id ack/nack counters and timeouts
//! - A single-writer device session with telemetry polling
//! - Persisted device parameters applied in priority order
//! - Firmware updates through stm32flash
//!
//! ## Example
//!
//! ```rust,ignore
//! use ping1d_core::prelude::*;
//!
//! let port = open_port("/dev/ttyUSB0", None)?;
//! let channel = SerialChannel::new(port);
//! let writer = channel.try_clone()?;
//!
//! let config = EngineConfig::default();
//! let device = PingDevice::new(Box::new(writer), config.request_timeout());
//! let (handle, _task) = Session::new(device, config).spawn();
//! spawn_reader(Box::new(channel), handle.clone());
//!
//! let snapshot = handle.snapshot().await?;
//! println!("distance: {} mm", snapshot.state.distance);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod device;
pub mod firmware;
pub mod protocol;
pub mod settings;

#[cfg(test)]
mod testutil;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{EngineConfig, FirmwareConfig};
    pub use crate::device::{spawn_reader, DeviceState, PingDevice, Session, SessionHandle};
    pub use crate::firmware::{FirmwareUpdater, UpdateRequest, UpdateState};
    pub use crate::protocol::{
        list_ports, open_port, CommunicationChannel, Message, MessageId, SerialChannel,
    };
    pub use crate::settings::{ConfigurationSynchronizer, JsonSettingsFile, Parameter};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
