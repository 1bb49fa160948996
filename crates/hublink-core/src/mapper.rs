// ── Controller inventory → device records ──
//
// The cloud thinks in devices; the controller in entities. An
// `EntityMapper` groups one into the other before a sync is submitted.

use std::collections::HashMap;

use hublink_api::{DeviceRegistryEntry, EntityRegistryEntry, EntityState};
use serde::{Deserialize, Serialize};

use crate::capability::{self, domain_rank};
use crate::model::{CapabilityType, DeviceType};

/// Everything the controller told us during a full sync.
#[derive(Debug, Clone, Default)]
pub struct ControllerInventory {
    pub states: Vec<EntityState>,
    pub entities: Vec<EntityRegistryEntry>,
    pub devices: Vec<DeviceRegistryEntry>,
}

/// One local device as submitted in `agent:sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub local_device_id: String,
    pub name: String,
    pub device_type: DeviceType,
    pub capabilities: Vec<CapabilityType>,
    pub entities: Vec<DeviceEntity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEntity {
    pub entity_id: String,
    pub capability_type: CapabilityType,
}

pub trait EntityMapper: Send + Sync {
    fn map_inventory(&self, inventory: &ControllerInventory) -> Vec<DeviceRecord>;
}

/// Domains that never describe a physical device.
const IGNORED_DOMAINS: &[&str] = &[
    "automation",
    "script",
    "scene",
    "zone",
    "person",
    "sun",
    "update",
    "device_tracker",
    "persistent_notification",
    "input_text",
    "input_select",
    "input_number",
    "input_datetime",
    "button",
    "event",
    "tts",
    "stt",
    "conversation",
    "weather",
];

/// Groups entities by registry device id. Entities without a device
/// become a device of their own, keyed by entity id.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEntityMapper;

impl EntityMapper for DefaultEntityMapper {
    fn map_inventory(&self, inventory: &ControllerInventory) -> Vec<DeviceRecord> {
        let registry: HashMap<&str, &EntityRegistryEntry> = inventory
            .entities
            .iter()
            .map(|entry| (entry.entity_id.as_str(), entry))
            .collect();
        let devices: HashMap<&str, &DeviceRegistryEntry> = inventory
            .devices
            .iter()
            .map(|device| (device.id.as_str(), device))
            .collect();

        // Preserve first-seen order so output is stable for a given inventory.
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<&EntityState>> = HashMap::new();

        for state in &inventory.states {
            if IGNORED_DOMAINS.contains(&state.domain()) {
                continue;
            }
            let entry = registry.get(state.entity_id.as_str());
            if entry.is_some_and(|e| !e.is_enabled()) {
                continue;
            }

            let key = entry
                .and_then(|e| e.device_id.clone())
                .unwrap_or_else(|| state.entity_id.clone());
            groups
                .entry(key.clone())
                .or_insert_with(|| {
                    order.push(key);
                    Vec::new()
                })
                .push(state);
        }

        order
            .into_iter()
            .filter_map(|key| {
                let states = groups.remove(&key)?;
                Some(build_record(key, &states, &devices))
            })
            .collect()
    }
}

/// Dimmable lights report brightness (which also conveys on/off).
fn declared_hint(state: &EntityState) -> Option<CapabilityType> {
    if state.domain() != "light" {
        return None;
    }
    let dimmable = state.attributes.contains_key("brightness")
        || state
            .attribute("supported_color_modes")
            .and_then(serde_json::Value::as_array)
            .is_some_and(|modes| modes.iter().any(|mode| mode.as_str() != Some("onoff")));
    dimmable.then_some(CapabilityType::Brightness)
}

fn build_record(
    key: String,
    states: &[&EntityState],
    devices: &HashMap<&str, &DeviceRegistryEntry>,
) -> DeviceRecord {
    let entities: Vec<DeviceEntity> = states
        .iter()
        .map(|state| DeviceEntity {
            entity_id: state.entity_id.clone(),
            capability_type: capability::infer_capability(
                &state.entity_id,
                state.friendly_name(),
                declared_hint(state),
                &[],
            ),
        })
        .collect();

    let mut capabilities: Vec<CapabilityType> = Vec::new();
    for entity in &entities {
        if !capabilities.contains(&entity.capability_type) {
            capabilities.push(entity.capability_type);
        }
    }

    let primary = states
        .iter()
        .min_by_key(|state| domain_rank(state.domain()))
        .copied();
    let device_type = primary.map_or(DeviceType::Other, |state| DeviceType::from_domain(state.domain()));

    let name = devices
        .get(key.as_str())
        .and_then(|device| device.display_name())
        .map(str::to_owned)
        .or_else(|| primary.and_then(EntityState::friendly_name).map(str::to_owned))
        .unwrap_or_else(|| key.clone());

    DeviceRecord {
        local_device_id: key,
        name,
        device_type,
        capabilities,
        entities,
    }
}
