//! Sonar configuration
//!
//! A fixed table of tunable parameters, applied to the device in ascending
//! priority so settings the device interprets relative to others (scan
//! window, gain) are written after the ones they depend on (ping interval,
//! speed of sound).

mod store;

pub use store::{JsonSettingsFile, MemoryStore, SettingsError, SettingsStore};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::protocol::ProtocolError;

/// Tunable sonar parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parameter {
    PingInterval,
    SpeedOfSound,
    AutomaticMode,
    GainIndex,
    LengthDistance,
    StartDistance,
}

/// Static description of a parameter: persisted key, priority tier, bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterDescriptor {
    pub parameter: Parameter,
    /// Key used in the persisted map
    pub key: &'static str,
    /// Lower tiers are applied first
    pub priority: u8,
    pub default: i64,
    pub min: i64,
    pub max: i64,
}

impl ParameterDescriptor {
    /// Value that would be written for `value`: itself when in bounds,
    /// otherwise the default.
    pub fn sanitize(&self, value: i64) -> i64 {
        if value < self.min || value > self.max {
            self.default
        } else {
            value
        }
    }
}

/// Every parameter, in application order
pub const PARAMETERS: [ParameterDescriptor; 6] = [
    ParameterDescriptor {
        parameter: Parameter::PingInterval,
        key: "1_pingInterval",
        priority: 1,
        default: 66,
        min: 20,
        max: 1000,
    },
    ParameterDescriptor {
        parameter: Parameter::SpeedOfSound,
        key: "1_speedOfSound",
        priority: 1,
        default: 1_500_000,
        min: 50_000,
        max: 10_000_000,
    },
    ParameterDescriptor {
        parameter: Parameter::AutomaticMode,
        key: "2_automaticMode",
        priority: 2,
        default: 1,
        min: 0,
        max: 1,
    },
    ParameterDescriptor {
        parameter: Parameter::GainIndex,
        key: "3_gainIndex",
        priority: 3,
        default: 0,
        min: 0,
        max: 6,
    },
    ParameterDescriptor {
        parameter: Parameter::LengthDistance,
        key: "3_lengthDistance",
        priority: 3,
        default: 5000,
        min: 500,
        max: 70_000,
    },
    ParameterDescriptor {
        parameter: Parameter::StartDistance,
        key: "3_startDistance",
        priority: 3,
        default: 0,
        min: 0,
        max: 70_000,
    },
];

impl Parameter {
    /// Descriptor for this parameter
    pub fn descriptor(self) -> &'static ParameterDescriptor {
        PARAMETERS
            .iter()
            .find(|d| d.parameter == self)
            .unwrap_or(&PARAMETERS[0])
    }

    /// Look up a parameter by its persisted key
    pub fn from_key(key: &str) -> Option<Self> {
        PARAMETERS.iter().find(|d| d.key == key).map(|d| d.parameter)
    }
}

/// Read/write access to the device value behind each parameter
pub trait ParameterTarget {
    /// Current value as last reported by the device
    fn read_parameter(&self, parameter: Parameter) -> i64;

    /// Send the value to the device
    fn write_parameter(&mut self, parameter: Parameter, value: i64) -> Result<(), ProtocolError>;
}

/// What happened when a configuration was applied
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Parameters written, in order, with the value actually sent
    pub applied: Vec<(Parameter, i64)>,
    /// Parameters whose stored value was out of range and replaced by the default
    pub defaulted: Vec<Parameter>,
    /// Keys in the input that name no parameter
    pub unknown_keys: Vec<String>,
    /// Writes that failed; later parameters were still attempted
    pub errors: Vec<(Parameter, ProtocolError)>,
}

impl ApplyReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Applies and captures parameter sets in priority order
#[derive(Debug, Clone)]
pub struct ConfigurationSynchronizer {
    order: Vec<&'static ParameterDescriptor>,
}

impl Default for ConfigurationSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigurationSynchronizer {
    pub fn new() -> Self {
        let mut order: Vec<&'static ParameterDescriptor> = PARAMETERS.iter().collect();
        // Stable: equal tiers keep table order
        order.sort_by_key(|d| d.priority);
        Self { order }
    }

    /// Descriptors in the order they are applied
    pub fn order(&self) -> impl Iterator<Item = &'static ParameterDescriptor> + '_ {
        self.order.iter().copied()
    }

    /// Apply every known key of `persisted` to `target`, lowest tier first
    pub fn load_and_apply<T: ParameterTarget + ?Sized>(
        &self,
        persisted: &BTreeMap<String, i64>,
        target: &mut T,
    ) -> ApplyReport {
        let mut report = ApplyReport {
            unknown_keys: persisted
                .keys()
                .filter(|k| Parameter::from_key(k).is_none())
                .cloned()
                .collect(),
            ..Default::default()
        };

        for descriptor in self.order() {
            let Some(&stored) = persisted.get(descriptor.key) else {
                continue;
            };

            let value = descriptor.sanitize(stored);
            if value != stored {
                warn!(
                    "{} = {} outside [{}, {}], using default {}",
                    descriptor.key, stored, descriptor.min, descriptor.max, descriptor.default
                );
                report.defaulted.push(descriptor.parameter);
            }

            debug!("Applying {} = {}", descriptor.key, value);
            match target.write_parameter(descriptor.parameter, value) {
                Ok(()) => report.applied.push((descriptor.parameter, value)),
                Err(e) => {
                    warn!("Failed to apply {}: {}", descriptor.key, e);
                    report.errors.push((descriptor.parameter, e));
                }
            }
        }

        report
    }

    /// Read every parameter from `target` for persistence
    pub fn capture_current<T: ParameterTarget + ?Sized>(&self, target: &T) -> BTreeMap<String, i64> {
        self.order()
            .map(|d| (d.key.to_string(), target.read_parameter(d.parameter)))
            .collect()
    }

    /// Default value of every parameter
    pub fn defaults(&self) -> BTreeMap<String, i64> {
        self.order().map(|d| (d.key.to_string(), d.default)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingTarget {
        values: HashMap<Parameter, i64>,
        writes: Vec<(Parameter, i64)>,
        fail_on: Option<Parameter>,
    }

    impl ParameterTarget for RecordingTarget {
        fn read_parameter(&self, parameter: Parameter) -> i64 {
            self.values.get(&parameter).copied().unwrap_or(0)
        }

        fn write_parameter(&mut self, parameter: Parameter, value: i64) -> Result<(), ProtocolError> {
            if self.fail_on == Some(parameter) {
                return Err(ProtocolError::NotConnected);
            }
            self.writes.push((parameter, value));
            self.values.insert(parameter, value);
            Ok(())
        }
    }

    fn map(entries: &[(&str, i64)]) -> BTreeMap<String, i64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_applies_in_priority_order() {
        // Inserted in reverse; BTreeMap order must not matter either
        let persisted = map(&[
            ("3_gainIndex", 2),
            ("2_automaticMode", 0),
            ("1_pingInterval", 100),
        ]);
        let mut target = RecordingTarget::default();
        let report = ConfigurationSynchronizer::new().load_and_apply(&persisted, &mut target);

        assert!(report.is_ok());
        assert_eq!(
            target.writes,
            vec![
                (Parameter::PingInterval, 100),
                (Parameter::AutomaticMode, 0),
                (Parameter::GainIndex, 2),
            ]
        );
    }

    #[test]
    fn test_out_of_range_uses_default() {
        let persisted = map(&[("3_lengthDistance", 100)]);
        let mut target = RecordingTarget::default();
        let report = ConfigurationSynchronizer::new().load_and_apply(&persisted, &mut target);

        assert_eq!(target.writes, vec![(Parameter::LengthDistance, 5000)]);
        assert_eq!(report.defaulted, vec![Parameter::LengthDistance]);
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let d = Parameter::GainIndex.descriptor();
        assert_eq!(d.sanitize(0), 0);
        assert_eq!(d.sanitize(6), 6);
        assert_eq!(d.sanitize(7), 0);
        assert_eq!(d.sanitize(-1), 0);
    }

    #[test]
    fn test_unknown_keys_are_reported() {
        let persisted = map(&[("9_bogus", 1), ("1_speedOfSound", 1_450_000)]);
        let mut target = RecordingTarget::default();
        let report = ConfigurationSynchronizer::new().load_and_apply(&persisted, &mut target);

        assert_eq!(report.unknown_keys, vec!["9_bogus".to_string()]);
        assert_eq!(target.writes, vec![(Parameter::SpeedOfSound, 1_450_000)]);
    }

    #[test]
    fn test_failed_write_does_not_stop_later_parameters() {
        let persisted = map(&[("1_pingInterval", 100), ("3_gainIndex", 3)]);
        let mut target = RecordingTarget {
            fail_on: Some(Parameter::PingInterval),
            ..Default::default()
        };
        let report = ConfigurationSynchronizer::new().load_and_apply(&persisted, &mut target);

        assert_eq!(report.errors.len(), 1);
        assert_eq!(target.writes, vec![(Parameter::GainIndex, 3)]);
    }

    #[test]
    fn test_capture_then_apply_is_idempotent() {
        let sync = ConfigurationSynchronizer::new();
        let mut target = RecordingTarget::default();
        sync.load_and_apply(&sync.defaults(), &mut target);
        let captured = sync.capture_current(&target);
        assert_eq!(captured, sync.defaults());

        let before = target.values.clone();
        sync.load_and_apply(&captured, &mut target);
        assert_eq!(target.values, before);
    }

    #[test]
    fn test_key_lookup() {
        assert_eq!(Parameter::from_key("3_startDistance"), Some(Parameter::StartDistance));
        assert_eq!(Parameter::from_key("startDistance"), None);
        assert_eq!(Parameter::SpeedOfSound.descriptor().key, "1_speedOfSound");
    }
}
