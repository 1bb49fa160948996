// ── Controller wire protocol ──
//
// JSON text frames tagged by `type`. The client authenticates with an
// `auth` frame carrying the bearer token, then issues commands with a
// client-assigned integer `id`; the controller answers with `result`,
// `pong`, or streams `event` frames tagged with the subscription id.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

// ── Domain payloads ──────────────────────────────────────────────────

/// Current state of one controller entity (e.g. `light.kitchen`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub last_changed: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
}

impl EntityState {
    /// The domain prefix of the entity id (`light` for `light.kitchen`).
    pub fn domain(&self) -> &str {
        entity_domain(&self.entity_id)
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key).filter(|v| !v.is_null())
    }

    /// Numeric attribute, accepting both JSON numbers and numeric strings.
    pub fn attribute_f64(&self, key: &str) -> Option<f64> {
        match self.attribute(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        }
    }

    pub fn friendly_name(&self) -> Option<&str> {
        self.attribute("friendly_name").and_then(Value::as_str)
    }

    /// `unavailable` / `unknown` carry no usable value.
    pub fn is_unavailable(&self) -> bool {
        matches!(self.state.as_str(), "unavailable" | "unknown" | "")
    }
}

/// The domain prefix of a raw entity id. Returns the whole id if it has no dot.
pub fn entity_domain(entity_id: &str) -> &str {
    entity_id.split_once('.').map_or(entity_id, |(domain, _)| domain)
}

/// A per-entity change produced from a `state_changed` event.
///
/// `old_state` comes from the link's last-known-state cache when the
/// entity has been seen before, falling back to what the event carried.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub entity_id: String,
    pub old_state: Option<EntityState>,
    pub new_state: Option<EntityState>,
}

/// Any other subscribed event, passed through untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerEvent {
    pub subscription: u64,
    pub event_type: String,
    pub data: Value,
    pub time_fired: Option<String>,
}

/// Entry from `config/entity_registry/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRegistryEntry {
    pub entity_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub original_name: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub disabled_by: Option<String>,
    #[serde(default)]
    pub hidden_by: Option<String>,
}

impl EntityRegistryEntry {
    pub fn is_enabled(&self) -> bool {
        self.disabled_by.is_none() && self.hidden_by.is_none()
    }
}

/// Entry from `config/device_registry/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRegistryEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub name_by_user: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub area_id: Option<String>,
}

impl DeviceRegistryEntry {
    /// User-assigned name first, then the integration's name.
    pub fn display_name(&self) -> Option<&str> {
        self.name_by_user.as_deref().or(self.name.as_deref())
    }
}

/// Target selector for `call_service`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTarget {
    pub entity_id: String,
}

// ── Outbound commands ────────────────────────────────────────────────

/// Commands the link can issue. Serialized with the `type` tag; the
/// correlation `id` is injected by [`encode_command`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ControllerCommand {
    #[serde(rename = "get_states")]
    GetStates,

    #[serde(rename = "call_service")]
    CallService {
        domain: String,
        service: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        service_data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<ServiceTarget>,
    },

    #[serde(rename = "subscribe_events")]
    SubscribeEvents {
        #[serde(skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
    },

    #[serde(rename = "unsubscribe_events")]
    UnsubscribeEvents { subscription: u64 },

    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "config/entity_registry/list")]
    ListEntityRegistry,

    #[serde(rename = "config/device_registry/list")]
    ListDeviceRegistry,
}

/// Serialize a command and stamp it with its correlation id.
pub(crate) fn encode_command(id: u64, command: &ControllerCommand) -> Result<String, Error> {
    let mut value = serde_json::to_value(command)?;
    if let Value::Object(ref mut fields) = value {
        fields.insert("id".into(), Value::from(id));
    }
    Ok(value.to_string())
}

pub(crate) fn encode_auth(access_token: &str) -> String {
    serde_json::json!({ "type": "auth", "access_token": access_token }).to_string()
}

// ── Inbound frames ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum InboundFrame {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<RemoteError>,
    },
    Event {
        id: u64,
        event: RawEvent,
    },
    Pong {
        id: u64,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RemoteError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl RemoteError {
    pub(crate) fn into_error(self) -> Error {
        Error::Protocol {
            code: self.code.unwrap_or_else(|| "unknown_error".into()),
            message: self.message.unwrap_or_else(|| "request failed".into()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawEvent {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub time_fired: Option<String>,
}

/// `data` of a `state_changed` event.
#[derive(Debug, Deserialize)]
pub(crate) struct StateChangedData {
    pub entity_id: String,
    #[serde(default)]
    pub old_state: Option<EntityState>,
    #[serde(default)]
    pub new_state: Option<EntityState>,
}

pub(crate) fn decode_frame(text: &str) -> Result<InboundFrame, Error> {
    serde_json::from_str(text).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: text.to_owned(),
    })
}

/// Decode a `result` payload into a typed value, keeping the raw body on failure.
pub(crate) fn decode_result<T: DeserializeOwned>(value: &Value) -> Result<T, Error> {
    T::deserialize(value).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: value.to_string(),
    })
}
