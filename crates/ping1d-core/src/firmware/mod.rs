//! Firmware Update
//!
//! Drives an external flasher (stm32flash) through the update stages:
//!
//! 1. **EnteringBootloader** - optionally send "goto bootloader" and wait
//!    for the port to come back at the bootloader baud rate
//! 2. **Transferring** - flasher writes the image, progress is parsed from
//!    its output
//! 3. **Verifying** - read-back check, only with `verify`; not cancellable
//! 4. **Complete** or **Failed** with a [`FailureReason`]

mod link;
mod progress;
mod runner;
mod updater;

pub use link::{BootloaderLink, SerialBootloaderLink};
pub use progress::parse_progress;
pub use runner::{FlashInvocation, FlashProcess, ProcessRunner, Stm32FlashProcess, Stm32FlashRunner};
pub use updater::{FirmwareObserver, FirmwareUpdater, UpdateSession};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Default baud rate for the serial bootloader
pub const DEFAULT_BOOTLOADER_BAUD: u32 = 57600;

/// Why an update ended in [`UpdateState::Failed`]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    #[error("flasher could not be launched")]
    LaunchFailure,

    #[error("flasher exited with an error during transfer")]
    TransferFailure,

    #[error("written image did not verify")]
    VerifyMismatch,

    #[error("device did not come back in bootloader mode")]
    LinkLost,

    #[error("flasher did not finish in time")]
    Timeout,

    #[error("cancelled")]
    Cancelled,
}

/// Update state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateState {
    Idle,
    EnteringBootloader,
    Transferring,
    Verifying,
    Complete,
    Failed(FailureReason),
}

impl UpdateState {
    /// Whether a cancellation request is honoured in this state
    pub fn is_cancellable(&self) -> bool {
        matches!(self, UpdateState::EnteringBootloader | UpdateState::Transferring)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdateState::Complete | UpdateState::Failed(_))
    }
}

/// Parameters of one flash attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// Serial port the device is attached to
    pub port: String,
    /// Firmware image (.hex or .bin)
    pub image_path: PathBuf,
    /// Bootloader baud rate
    pub baud: u32,
    /// Send "goto bootloader" first; otherwise the device must already be in it
    pub send_goto_bootloader: bool,
    /// Read back and verify after writing
    pub verify: bool,
}

impl UpdateRequest {
    pub fn new(port: impl Into<String>, image_path: impl Into<PathBuf>) -> Self {
        Self {
            port: port.into(),
            image_path: image_path.into(),
            baud: DEFAULT_BOOTLOADER_BAUD,
            send_goto_bootloader: true,
            verify: true,
        }
    }
}

/// Notification published to firmware observers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FirmwareEvent {
    StateChanged(UpdateState),
    /// Percent written, 0-100
    Progress(f32),
    Complete,
    Failed(FailureReason),
}
