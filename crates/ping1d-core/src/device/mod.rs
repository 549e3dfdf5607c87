//! Sonar device engine
//!
//! Owns everything that describes one device session: decoded state, request
//! counters, and the link writer. Mutation goes through [`PingDevice`] only;
//! [`session`] wraps it in a single task so transport and timer callbacks
//! are serialized.

mod ping;
mod poller;
pub mod session;
mod state;

pub use ping::PingDevice;
pub use poller::Poller;
pub use session::{spawn_reader, Session, SessionHandle, SessionSnapshot};
pub use state::{DeviceField, DeviceState};

use serde::{Deserialize, Serialize};

/// Upper bound for `set_ping_frequency`, in pings per second
pub const PING_MAX_FREQUENCY: f32 = 50.0;

/// Notification published to device observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceEvent {
    /// A field of [`DeviceState`] took a new value
    StateChanged(DeviceField),
    /// The count of dropped frames changed
    ParserErrorsChanged(u32),
    /// The count of requests that timed out changed
    LostMessagesChanged(u32),
}

/// Observer callback
pub type DeviceObserver = Box<dyn Fn(&DeviceEvent) + Send + Sync>;

/// Clock shared by the device and its session; honours tokio's paused time
pub(crate) fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}
