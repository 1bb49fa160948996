// ── Commands, updates, and the agent's response shapes ──
//
// Everything here crosses the cloud socket, so field names are camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::capability::{CapabilityType, CapabilityValue};
use super::mapping::EntityMapping;
use crate::mapper::DeviceRecord;

/// Inbound instruction to change one capability of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceControlCommand {
    /// Remote device id, local device id, or a raw entity id.
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub capability_type: CapabilityType,
    pub value: CapabilityValue,
}

/// Externally sourced capability change (`capability:update`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityUpdate {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub capability_type: CapabilityType,
    pub value: CapabilityValue,
    /// Who produced the change. Updates carrying our own agent id are
    /// echoes of our pushes.
    #[serde(default)]
    pub source: Option<String>,
}

impl CapabilityUpdate {
    pub fn into_command(self) -> DeviceControlCommand {
        DeviceControlCommand {
            device_id: self.device_id,
            entity_id: self.entity_id,
            capability_type: self.capability_type,
            value: self.value,
        }
    }
}

/// Outbound push (`capability:changed`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityChanged {
    pub home_id: String,
    pub device_id: String,
    pub entity_id: String,
    pub capability_type: CapabilityType,
    pub value: CapabilityValue,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

/// Machine-checkable failure carried by every response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    pub success: bool,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ControlResponse {
    pub fn failed(device_id: impl Into<String>, error: ErrorBody) -> Self {
        Self {
            success: false,
            device_id: device_id.into(),
            entity_id: None,
            message: error.message.clone(),
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    pub synced_device_count: usize,
    pub watching: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_id: Option<String>,
    pub generation: u64,
    pub mapping_count: usize,
    pub events_received: u64,
    pub updates_skipped: u64,
    pub updates_deduped: u64,
    pub updates_sent: u64,
    pub updates_failed: u64,
}

// ── Sync protocol payloads ───────────────────────────────────────────

/// `agent:sync` request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AgentSyncRequest<'a> {
    pub agent_id: &'a str,
    pub home_id: &'a str,
    pub devices: &'a [DeviceRecord],
}

/// `agent:sync` acknowledgement: the server-confirmed mapping.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AgentSyncResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub mappings: Vec<EntityMapping>,
    #[serde(default)]
    pub message: Option<String>,
}

/// `agent:devices` acknowledgement: devices on file for this agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AgentDevicesResponse {
    #[serde(default)]
    pub home_id: Option<String>,
    #[serde(default)]
    pub devices: Vec<serde_json::Value>,
}

fn default_true() -> bool {
    true
}
