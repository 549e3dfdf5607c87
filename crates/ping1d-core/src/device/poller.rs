//! Periodic re-requests of slowly changing telemetry

use std::time::Instant;
use tracing::trace;

use super::PingDevice;
use crate::protocol::MessageId;

/// Requests a fixed set of ids on every tick, skipping ids still in flight
#[derive(Debug, Clone)]
pub struct Poller {
    ids: Vec<MessageId>,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new(vec![
            MessageId::ProcessorTemperature,
            MessageId::PcbTemperature,
            MessageId::Voltage5,
        ])
    }
}

impl Poller {
    pub fn new(ids: Vec<MessageId>) -> Self {
        Self { ids }
    }

    pub fn ids(&self) -> &[MessageId] {
        &self.ids
    }

    /// Issue one round of requests, returning the ids actually sent
    pub fn tick(&self, device: &mut PingDevice, now: Instant) -> Vec<MessageId> {
        let mut sent = Vec::new();
        for id in &self.ids {
            if device.tracker().is_waiting(*id) {
                trace!("Poll skipped {:?}: still waiting", id);
                continue;
            }
            match device.request_at(*id, now) {
                Ok(true) => sent.push(*id),
                Ok(false) => {}
                Err(e) => trace!("Poll request for {:?} failed: {}", id, e),
            }
        }
        sent
    }
}
