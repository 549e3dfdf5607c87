//! Update state machine

use serde::Serialize;
use std::time::Duration;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    parse_progress, BootloaderLink, FailureReason, FirmwareEvent, FlashInvocation, FlashProcess,
    ProcessRunner, UpdateRequest, UpdateState,
};
use crate::config::FirmwareConfig;

/// Grace period for reaping a killed flasher
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

pub type FirmwareObserver = Box<dyn Fn(&FirmwareEvent) + Send + Sync>;

/// The one update in flight
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateSession {
    pub request: UpdateRequest,
    pub state: UpdateState,
    pub progress: f32,
}

/// Runs firmware updates one at a time
pub struct FirmwareUpdater {
    program: String,
    flash_timeout: Duration,
    session: Option<UpdateSession>,
    observers: Vec<FirmwareObserver>,
}

impl FirmwareUpdater {
    pub fn new(config: &FirmwareConfig) -> Self {
        Self {
            program: config.flasher_program.clone(),
            flash_timeout: config.flash_timeout(),
            session: None,
            observers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, observer: impl Fn(&FirmwareEvent) + Send + Sync + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Current state; `Idle` when no update is running
    pub fn state(&self) -> UpdateState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(UpdateState::Idle)
    }

    pub fn session(&self) -> Option<&UpdateSession> {
        self.session.as_ref()
    }

    /// Run one update to completion and return its terminal state.
    ///
    /// `cancel` is honoured while entering the bootloader and while the
    /// image is transferring. Once verification starts the run finishes
    /// on its own.
    pub async fn run<R, L>(
        &mut self,
        request: UpdateRequest,
        runner: &mut R,
        link: &mut L,
        cancel: &CancellationToken,
    ) -> UpdateState
    where
        R: ProcessRunner,
        L: BootloaderLink,
    {
        info!(
            "Flashing {} to {} at {} baud",
            request.image_path.display(),
            request.port,
            request.baud
        );
        self.session = Some(UpdateSession {
            request: request.clone(),
            state: UpdateState::Idle,
            progress: 0.0,
        });

        let final_state = match self.drive(&request, runner, link, cancel).await {
            Ok(()) => {
                self.transition(UpdateState::Complete);
                self.notify(&FirmwareEvent::Complete);
                info!("Firmware update complete");
                UpdateState::Complete
            }
            Err(reason) => {
                self.transition(UpdateState::Failed(reason));
                self.notify(&FirmwareEvent::Failed(reason));
                warn!("Firmware update failed: {}", reason);
                UpdateState::Failed(reason)
            }
        };

        self.session = None;
        final_state
    }

    async fn drive<R, L>(
        &mut self,
        request: &UpdateRequest,
        runner: &mut R,
        link: &mut L,
        cancel: &CancellationToken,
    ) -> Result<(), FailureReason>
    where
        R: ProcessRunner,
        L: BootloaderLink,
    {
        self.transition(UpdateState::EnteringBootloader);

        if request.send_goto_bootloader {
            let entering = async {
                link.goto_bootloader().await?;
                link.await_bootloader(request.baud).await
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FailureReason::Cancelled),
                result = entering => result.map_err(|e| {
                    warn!("Bootloader link lost: {}", e);
                    FailureReason::LinkLost
                })?,
            }
        }
        if cancel.is_cancelled() {
            return Err(FailureReason::Cancelled);
        }

        let invocation = FlashInvocation::new(self.program.clone(), request);
        let mut process = runner.spawn(&invocation).map_err(|e| {
            warn!("Could not launch {}: {}", invocation.program, e);
            FailureReason::LaunchFailure
        })?;
        self.transition(UpdateState::Transferring);

        let result = self.supervise(&mut process, request.verify, cancel).await;
        if result.is_err() {
            if let Err(e) = process.kill() {
                debug!("Kill flasher: {}", e);
            }
            let _ = timeout(REAP_TIMEOUT, process.wait()).await;
        }
        result
    }

    async fn supervise<P: FlashProcess>(
        &mut self,
        process: &mut P,
        verify: bool,
        cancel: &CancellationToken,
    ) -> Result<(), FailureReason> {
        let deadline = Instant::now() + self.flash_timeout;

        loop {
            let line = if self.state().is_cancellable() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(FailureReason::Cancelled),
                    _ = sleep_until(deadline) => return Err(FailureReason::Timeout),
                    line = process.next_line() => line,
                }
            } else {
                tokio::select! {
                    _ = sleep_until(deadline) => return Err(FailureReason::Timeout),
                    line = process.next_line() => line,
                }
            };
            let Some(line) = line else {
                break;
            };

            debug!("flasher: {}", line);
            if let Some(percent) = parse_progress(&line) {
                self.report_progress(percent);
                if verify && percent >= 100.0 && self.state() == UpdateState::Transferring {
                    self.transition(UpdateState::Verifying);
                }
            }
        }

        let code = tokio::select! {
            _ = sleep_until(deadline) => return Err(FailureReason::Timeout),
            code = process.wait() => code.unwrap_or_else(|e| {
                warn!("Waiting for flasher: {}", e);
                -1
            }),
        };
        debug!("Flasher exited with {}", code);

        match (code, self.state()) {
            (0, UpdateState::Transferring) if verify => {
                self.transition(UpdateState::Verifying);
                Ok(())
            }
            (0, _) => Ok(()),
            (_, UpdateState::Verifying) => Err(FailureReason::VerifyMismatch),
            _ => Err(FailureReason::TransferFailure),
        }
    }

    fn transition(&mut self, state: UpdateState) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.state == state {
            return;
        }
        debug!("Update state {:?} -> {:?}", session.state, state);
        session.state = state;
        self.notify(&FirmwareEvent::StateChanged(state));
    }

    fn report_progress(&mut self, percent: f32) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.progress == percent {
            return;
        }
        session.progress = percent;
        self.notify(&FirmwareEvent::Progress(percent));
    }

    fn notify(&self, event: &FirmwareEvent) {
        for observer in &self.observers {
            observer(event);
        }
    }
}
