// ── Entity ↔ remote device mapping ──

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::capability::{CapabilityType, DeviceType};

/// Binds one controller entity to the cloud's device record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMapping {
    pub remote_device_id: String,
    pub local_device_id: String,
    pub entity_id: String,
    pub capability_type: CapabilityType,
    pub device_type: DeviceType,
}

/// One generation's mapping table, keyed by entity id, iterable in the
/// order the mappings were received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingTable {
    entries: Vec<EntityMapping>,
    by_entity: HashMap<String, usize>,
}

impl MappingTable {
    /// Build a table. A repeated entity id keeps its first position but
    /// takes the later mapping.
    pub fn new(mappings: impl IntoIterator<Item = EntityMapping>) -> Self {
        let mut table = Self::default();
        for mapping in mappings {
            if let Some(&index) = table.by_entity.get(&mapping.entity_id) {
                tracing::warn!(
                    entity_id = %mapping.entity_id,
                    "duplicate entity in mapping table, last one wins"
                );
                if let Some(slot) = table.entries.get_mut(index) {
                    *slot = mapping;
                }
            } else {
                table
                    .by_entity
                    .insert(mapping.entity_id.clone(), table.entries.len());
                table.entries.push(mapping);
            }
        }
        table
    }

    pub fn get(&self, entity_id: &str) -> Option<&EntityMapping> {
        self.by_entity
            .get(entity_id)
            .and_then(|&index| self.entries.get(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityMapping> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct remote devices.
    pub fn device_count(&self) -> usize {
        let mut seen: Vec<&str> = self.entries.iter().map(|m| m.remote_device_id.as_str()).collect();
        seen.sort_unstable();
        seen.dedup();
        seen.len()
    }
}

/// The committed result of a sync: "are we synced" is exactly "does a
/// snapshot exist". Replaced wholesale, never patched.
#[derive(Debug, Clone)]
pub struct SyncSnapshot {
    pub home_id: String,
    pub mappings: Arc<MappingTable>,
    pub created_at: DateTime<Utc>,
    /// Monotonic per coordinator; the watcher and dispatcher built from
    /// this snapshot carry the same number.
    pub generation: u64,
}
