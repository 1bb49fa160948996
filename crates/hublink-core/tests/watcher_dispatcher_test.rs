#![allow(clippy::unwrap_used)]
// Change watcher and command dispatcher against in-memory links.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::{MockCloud, MockController, eventually, mapping};
use hublink_core::{
    CapabilityType, CapabilityValue, CommandDispatcher, CommandError, DefaultEntityMapper,
    DeviceControlCommand, MappingTable, SyncConfig, SyncCoordinator,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn coordinator(controller: &Arc<MockController>, cloud: &Arc<MockCloud>) -> SyncCoordinator {
    SyncCoordinator::new(
        controller.clone(),
        cloud.clone(),
        Arc::new(DefaultEntityMapper),
        SyncConfig {
            auto_restore: false,
            ..SyncConfig::default()
        },
    )
}

fn dispatcher(controller: &Arc<MockController>, mappings: MappingTable) -> CommandDispatcher {
    CommandDispatcher::new(
        controller.clone(),
        Arc::new(mappings),
        1,
        Duration::from_secs(10),
    )
}

fn command(
    device_id: &str,
    capability: CapabilityType,
    value: CapabilityValue,
) -> DeviceControlCommand {
    DeviceControlCommand {
        device_id: device_id.into(),
        entity_id: None,
        capability_type: capability,
        value,
    }
}

// ── Watcher ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_watcher_never_pushes_equal_values_twice() {
    let controller = MockController::new();
    let cloud = MockCloud::new("agent-1");
    let coordinator = coordinator(&controller, &cloud);
    coordinator
        .initialize_from_sync(
            "home-1",
            vec![mapping("remote-1", "light.kitchen", CapabilityType::Brightness)],
        )
        .await;

    // 191 → 75, 192 → 75 (deduped), 255 → 100, off → 0, off → 0 (deduped)
    for (state, brightness) in [("on", 191), ("on", 192), ("on", 255), ("off", 0), ("off", 0)] {
        controller.change("light.kitchen", state, json!({ "brightness": brightness }));
    }
    // Untracked entities are ignored entirely.
    controller.change("light.porch", "on", json!({ "brightness": 10 }));

    assert!(eventually(|| coordinator.stats().events_received == 5).await);
    let values: Vec<_> = cloud
        .emitted("capability:changed")
        .iter()
        .map(|push| push["value"].clone())
        .collect();
    assert_eq!(values, vec![json!(75.0), json!(100.0), json!(0.0)]);

    let stats = coordinator.stats();
    assert_eq!(stats.updates_sent, 3);
    assert_eq!(stats.updates_deduped, 2);
    assert_eq!(stats.updates_skipped, 2);
}

#[tokio::test]
async fn test_watcher_push_carries_remote_device_and_source() {
    let controller = MockController::new();
    let cloud = MockCloud::new("agent-1");
    let coordinator = coordinator(&controller, &cloud);
    coordinator
        .initialize_from_sync(
            "home-1",
            vec![
                mapping("remote-1", "light.desk", CapabilityType::ColorTemperature),
                mapping("remote-2", "vacuum.robot", CapabilityType::Switch),
            ],
        )
        .await;

    controller.change("light.desk", "on", json!({ "color_temp": 250 }));
    controller.change("vacuum.robot", "cleaning", json!({}));

    assert!(eventually(|| cloud.emitted("capability:changed").len() == 2).await);
    let pushes = cloud.emitted("capability:changed");

    assert_eq!(pushes[0]["homeId"], "home-1");
    assert_eq!(pushes[0]["deviceId"], "remote-1");
    assert_eq!(pushes[0]["entityId"], "light.desk");
    assert_eq!(pushes[0]["capabilityType"], "color_temperature");
    assert_eq!(pushes[0]["value"], json!(4000.0));
    assert_eq!(pushes[0]["source"], "agent-1");

    assert_eq!(pushes[1]["capabilityType"], "switch");
    assert_eq!(pushes[1]["value"], json!(true));
}

#[tokio::test]
async fn test_failed_push_is_retried_on_next_change() {
    let controller = MockController::new();
    let cloud = MockCloud::new("agent-1");
    let coordinator = coordinator(&controller, &cloud);
    coordinator
        .initialize_from_sync(
            "home-1",
            vec![mapping("remote-1", "switch.heater", CapabilityType::Switch)],
        )
        .await;

    cloud.set_connected(false);
    controller.change("switch.heater", "on", json!({}));
    assert!(eventually(|| coordinator.stats().updates_failed == 1).await);

    cloud.set_connected(true);
    controller.change("switch.heater", "on", json!({}));
    assert!(eventually(|| coordinator.stats().updates_sent == 1).await);
    assert_eq!(cloud.emitted("capability:changed").len(), 1);
}

#[tokio::test]
async fn test_unavailable_states_are_skipped() {
    let controller = MockController::new();
    let cloud = MockCloud::new("agent-1");
    let coordinator = coordinator(&controller, &cloud);
    coordinator
        .initialize_from_sync(
            "home-1",
            vec![mapping("remote-1", "sensor.outdoor_temperature", CapabilityType::Temperature)],
        )
        .await;

    controller.change("sensor.outdoor_temperature", "unavailable", json!({}));
    controller.change("sensor.outdoor_temperature", "12.5", json!({}));

    assert!(eventually(|| coordinator.stats().events_received == 2).await);
    let stats = coordinator.stats();
    assert_eq!(stats.updates_skipped, 1);
    assert_eq!(stats.updates_deduped, 0);
    assert_eq!(cloud.emitted("capability:changed")[0]["value"], json!(12.5));
}

// ── Dispatcher ──────────────────────────────────────────────────────

fn lamp_mappings() -> MappingTable {
    MappingTable::new([
        mapping("remote-1", "sensor.lamp_power", CapabilityType::Power),
        mapping("remote-1", "switch.lamp_plug", CapabilityType::Switch),
        mapping("remote-1", "light.lamp", CapabilityType::Brightness),
    ])
}

#[tokio::test]
async fn test_resolution_prefers_capability_domain_and_is_deterministic() {
    let controller = MockController::new();
    let dispatcher = dispatcher(&controller, lamp_mappings());

    for _ in 0..3 {
        assert_eq!(
            dispatcher
                .resolve_entity("remote-1", None, CapabilityType::Brightness)
                .unwrap(),
            "light.lamp"
        );
        // First mapped entity in a preferred domain, in mapping order.
        assert_eq!(
            dispatcher
                .resolve_entity("remote-1", None, CapabilityType::Switch)
                .unwrap(),
            "switch.lamp_plug"
        );
    }

    // No cover on the device: falls back to the primary entity (light wins).
    assert_eq!(
        dispatcher
            .resolve_entity("remote-1", None, CapabilityType::Position)
            .unwrap(),
        "light.lamp"
    );
    // Local ids resolve through the remote device.
    assert_eq!(
        dispatcher
            .resolve_entity("local-remote-1", None, CapabilityType::Brightness)
            .unwrap(),
        "light.lamp"
    );
    // Explicit entity ids win.
    assert_eq!(
        dispatcher
            .resolve_entity("remote-1", Some("light.other"), CapabilityType::Switch)
            .unwrap(),
        "light.other"
    );
}

#[tokio::test]
async fn test_execute_translates_to_service_call() {
    let controller = MockController::new();
    let dispatcher = dispatcher(&controller, lamp_mappings());

    let outcome = dispatcher
        .execute(&command("remote-1", CapabilityType::Brightness, 40.0.into()))
        .await
        .unwrap();
    assert_eq!(outcome.entity_id, "light.lamp");

    let raw = dispatcher
        .execute(&command("fan.attic", CapabilityType::FanSpeed, 30.0.into()))
        .await
        .unwrap();
    assert_eq!(raw.entity_id, "fan.attic");

    let calls = controller.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].domain, "light");
    assert_eq!(calls[0].service, "turn_on");
    assert_eq!(calls[0].data, Some(json!({ "brightness_pct": 40 })));
    assert_eq!(calls[0].entity_id, "light.lamp");
    assert_eq!(calls[1].service, "set_percentage");
}

#[tokio::test]
async fn test_execute_reports_typed_failures() {
    let controller = MockController::new();
    let dispatcher = dispatcher(&controller, lamp_mappings());

    let missing = dispatcher
        .execute(&command("remote-404", CapabilityType::Switch, true.into()))
        .await
        .unwrap_err();
    assert_eq!(missing.code(), "device_not_found");

    let read_only = dispatcher
        .execute(&command("remote-1", CapabilityType::Power, 12.0.into()))
        .await
        .unwrap_err();
    assert!(matches!(read_only, CommandError::UnsupportedCapability { .. }));

    let wrong_shape = dispatcher
        .execute(&command("remote-1", CapabilityType::Switch, "yes".into()))
        .await
        .unwrap_err();
    assert_eq!(wrong_shape.code(), "unsupported_capability");
    assert!(controller.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_service_call_times_out() {
    let controller = MockController::new();
    controller.set_call_delay(Duration::from_secs(60));
    let dispatcher = dispatcher(&controller, lamp_mappings());

    let err = dispatcher
        .execute(&command("remote-1", CapabilityType::Switch, true.into()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "execution_failed");
    assert!(err.to_string().contains("timed out after 10000ms"));
}
