use ping1d_core::protocol::ProtocolError;
use ping1d_core::settings::{
    ConfigurationSynchronizer, JsonSettingsFile, Parameter, ParameterTarget, SettingsStore,
    PARAMETERS,
};
use pretty_assertions::assert_eq;
use std::collections::{BTreeMap, HashMap};
use tempfile::TempDir;

/// Target that records writes and reads back what was written
#[derive(Default)]
struct Recorder {
    values: HashMap<Parameter, i64>,
    writes: Vec<(Parameter, i64)>,
}

impl ParameterTarget for Recorder {
    fn read_parameter(&self, parameter: Parameter) -> i64 {
        self.values.get(&parameter).copied().unwrap_or_default()
    }

    fn write_parameter(&mut self, parameter: Parameter, value: i64) -> Result<(), ProtocolError> {
        self.values.insert(parameter, value);
        self.writes.push((parameter, value));
        Ok(())
    }
}

fn stored(pairs: &[(&str, i64)]) -> BTreeMap<String, i64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

#[test]
fn test_priorities_apply_in_tier_order() {
    let sync = ConfigurationSynchronizer::new();
    let mut target = Recorder::default();
    let values = stored(&[
        ("3_startDistance", 100),
        ("3_gainIndex", 2),
        ("2_automaticMode", 0),
        ("1_pingInterval", 100),
        ("3_lengthDistance", 8000),
        ("1_speedOfSound", 1_450_000),
    ]);

    sync.load_and_apply(&values, &mut target);

    let tiers: Vec<u8> = target
        .writes
        .iter()
        .map(|(p, _)| p.descriptor().priority)
        .collect();
    let mut sorted = tiers.clone();
    sorted.sort();
    assert_eq!(tiers, sorted);
    assert_eq!(target.writes.len(), PARAMETERS.len());
}

#[test]
fn test_out_of_range_uses_default() {
    let sync = ConfigurationSynchronizer::new();
    let mut target = Recorder::default();

    let report = sync.load_and_apply(&stored(&[("3_lengthDistance", 100)]), &mut target);

    assert_eq!(target.writes, vec![(Parameter::LengthDistance, 5000)]);
    assert_eq!(report.defaulted, vec![Parameter::LengthDistance]);
}

#[test]
fn test_apply_is_idempotent() {
    let sync = ConfigurationSynchronizer::new();
    let values = stored(&[("1_pingInterval", 250), ("3_gainIndex", 9), ("bogus", 1)]);

    let mut target = Recorder::default();
    sync.load_and_apply(&values, &mut target);
    let first = sync.capture_current(&target);
    let report = sync.load_and_apply(&values, &mut target);
    let second = sync.capture_current(&target);

    assert_eq!(first, second);
    assert_eq!(report.unknown_keys, vec!["bogus".to_string()]);
    assert_eq!(second["3_gainIndex"], 0);
}

#[test]
fn test_json_file_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("settings.json");
    let sync = ConfigurationSynchronizer::new();

    let mut file = JsonSettingsFile::new(&path);
    assert!(file.load().unwrap().is_empty());
    file.save(&sync.defaults()).unwrap();

    let reopened = JsonSettingsFile::new(&path);
    assert_eq!(reopened.load().unwrap(), sync.defaults());
}
