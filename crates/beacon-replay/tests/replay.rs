//! End-to-end replays through the public harness API.

use std::path::PathBuf;

use beacon_core::decoder::encode_ibeacon;
use beacon_core::EngineConfig;
use beacon_replay::{replay, Channel, Emitted, ReplayError, Scenario};
use serde_json::{json, Value};
use tempfile::TempDir;
use uuid::Uuid;

const UUID: &str = "2F234454-CF6D-4A0F-ADF2-F4911BA9FFA6";

fn ibeacon_hex(major: u16, minor: u16) -> String {
    hex::encode(encode_ibeacon(Uuid::parse_str(UUID).unwrap(), major, minor, -59))
}

fn events(lines: &[Emitted], channel: Channel) -> Vec<Value> {
    lines
        .iter()
        .filter(|line| line.channel == channel)
        .filter_map(|line| line.event.clone())
        .collect()
}

fn command<'a>(lines: &'a [Emitted], name: &str) -> &'a Emitted {
    lines
        .iter()
        .find(|line| line.command.as_deref() == Some(name))
        .unwrap_or_else(|| panic!("no output for {name}"))
}

fn sample_scenario() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("scenarios")
        .join("ranging.json")
}

#[tokio::test]
async fn test_sample_scenario_replays() {
    let scenario = Scenario::load(sample_scenario()).unwrap();
    let lines = replay(scenario, &EngineConfig::default()).await.unwrap();

    assert_eq!(command(&lines, "initialize_and_check").event, Some(json!("ok")));
    assert_eq!(command(&lines, "bluetooth_state").event, Some(json!("STATE_ON")));
    assert_eq!(
        events(&lines, Channel::Authorization),
        vec![json!("ALLOWED")]
    );

    let ranging = events(&lines, Channel::Ranging);
    assert_eq!(ranging.len(), 2);
    assert_eq!(ranging[0]["region"]["identifier"], "r1");
    assert_eq!(ranging[0]["beacons"].as_array().unwrap().len(), 1);
    assert_eq!(ranging[0]["beacons"][0]["accuracy"], "1.37");
    assert_eq!(ranging[1]["beacons"], json!([]));

    let monitoring = events(&lines, Channel::Monitoring);
    let office: Vec<&str> = monitoring
        .iter()
        .filter(|e| e["region"]["identifier"] == "office")
        .map(|e| e["event"].as_str().unwrap())
        .collect();
    assert_eq!(
        office,
        vec!["didDetermineStateForRegion", "didEnterRegion", "didExitRegion"]
    );
    let lab: Vec<&Value> = monitoring
        .iter()
        .filter(|e| e["region"]["identifier"] == "lab")
        .collect();
    assert_eq!(lab[0]["state"], "INSIDE");
}

#[tokio::test]
async fn test_permission_refusal_reported() {
    let scenario = Scenario::from_json(
        &json!({
            "platform": {"permission": "NOT_DETERMINED"},
            "answers": {"permission": "DENIED"},
            "steps": [
                {"command": "request_authorization"},
                {"command": "authorization_status"}
            ]
        })
        .to_string(),
    )
    .unwrap();
    let lines = replay(scenario, &EngineConfig::default()).await.unwrap();

    let request = command(&lines, "request_authorization");
    assert_eq!(request.error.as_ref().unwrap().kind, "PERMISSION_DENIED");
    assert_eq!(command(&lines, "authorization_status").event, Some(json!("DENIED")));
    assert_eq!(events(&lines, Channel::Authorization), vec![json!("DENIED")]);
}

#[tokio::test]
async fn test_malformed_regions_reported_on_channel_and_command() {
    let scenario = Scenario::from_json(
        &json!({
            "steps": [
                {"command": "start_ranging", "regions": [{"identifier": "r1", "major": 70000}]}
            ]
        })
        .to_string(),
    )
    .unwrap();
    let lines = replay(scenario, &EngineConfig::default()).await.unwrap();

    let errors: Vec<_> = lines
        .iter()
        .filter(|line| line.channel == Channel::Ranging)
        .filter_map(|line| line.error.as_ref())
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, "INVALID_REGION");
    assert_eq!(
        command(&lines, "start_ranging").error.as_ref().unwrap().kind,
        "INVALID_REGION"
    );
}

#[tokio::test]
async fn test_disabled_layout_is_not_decoded() {
    let scenario = Scenario::from_json(
        &json!({
            "steps": [
                {"command": "initialize", "altbeacon": false},
                {"command": "start_ranging", "regions": [{"identifier": "r1"}]},
                {"command": "cycle", "batches": [{
                    "region": "r1",
                    "advertisements": [{"data": ibeacon_hex(1, 2), "rssi": -60}]
                }]}
            ]
        })
        .to_string(),
    )
    .unwrap();
    let lines = replay(scenario, &EngineConfig::default()).await.unwrap();

    let ranging = events(&lines, Channel::Ranging);
    assert_eq!(ranging.len(), 1);
    assert_eq!(ranging[0]["beacons"], json!([]));
}

#[tokio::test]
async fn test_disconnect_restarts_monitoring() {
    let scenario = Scenario::from_json(
        &json!({
            "steps": [
                {"command": "start_monitoring", "regions": [{"identifier": "m1"}]},
                {"command": "cycle", "batches": [{
                    "region": "m1",
                    "advertisements": [{"data": ibeacon_hex(1, 2), "rssi": -60}]
                }]},
                {"command": "disconnect"},
                {"command": "cycle", "batches": [{
                    "region": "m1",
                    "advertisements": [{"data": ibeacon_hex(1, 2), "rssi": -60}]
                }]}
            ]
        })
        .to_string(),
    )
    .unwrap();
    let lines = replay(scenario, &EngineConfig::default()).await.unwrap();

    let kinds: Vec<String> = events(&lines, Channel::Monitoring)
        .iter()
        .map(|e| e["event"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        kinds,
        vec![
            "didDetermineStateForRegion",
            "didEnterRegion",
            "didDetermineStateForRegion"
        ]
    );
}

#[tokio::test]
async fn test_missing_scenario_file() {
    let dir = TempDir::new().unwrap();
    let result = Scenario::load(dir.path().join("absent.json"));
    assert!(matches!(result, Err(ReplayError::Read { .. })));
}

#[test]
fn test_scenario_loads_without_runtime() {
    let scenario = Scenario::load(sample_scenario()).unwrap();
    let lines = tokio_test::block_on(async {
        let mut config = EngineConfig::default();
        config.layouts.eddystone = false;
        replay(Scenario { steps: vec![], ..scenario }, &config).await
    })
    .unwrap();
    assert!(lines.is_empty());
}
