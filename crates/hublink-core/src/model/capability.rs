// ── Capability vocabulary ──

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

/// Numeric tolerance when comparing capability values.
pub const NUMERIC_EPSILON: f64 = 0.01;

/// One observable or controllable facet of a device. Closed set;
/// snake_case on the wire.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CapabilityType {
    Switch,
    Brightness,
    ColorTemperature,
    Temperature,
    Humidity,
    Battery,
    Power,
    Energy,
    Motion,
    Contact,
    Position,
    Lock,
    TargetTemperature,
    HvacMode,
    FanSpeed,
    Volume,
    Sensor,
}

impl CapabilityType {
    /// Whether a command for this capability can be turned into a
    /// controller action.
    pub fn is_controllable(self) -> bool {
        matches!(
            self,
            Self::Switch
                | Self::Brightness
                | Self::ColorTemperature
                | Self::Position
                | Self::Lock
                | Self::TargetTemperature
                | Self::HvacMode
                | Self::FanSpeed
                | Self::Volume
        )
    }
}

/// A capability reading or command argument. Untagged on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl CapabilityValue {
    /// Equality used for deduplication: numbers within
    /// [`NUMERIC_EPSILON`], everything else exact.
    pub fn approx_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => (a - b).abs() <= NUMERIC_EPSILON,
            _ => self == other,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number),
            Self::Text(s) => Value::String(s.clone()),
        }
    }
}

impl From<bool> for CapabilityValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for CapabilityValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for CapabilityValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

/// Coarse device category derived from the entity domains it exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceType {
    Light,
    Switch,
    Sensor,
    Climate,
    Cover,
    Lock,
    Fan,
    MediaPlayer,
    Vacuum,
    Other,
}

impl DeviceType {
    pub fn from_domain(domain: &str) -> Self {
        match domain {
            "light" => Self::Light,
            "switch" | "input_boolean" => Self::Switch,
            "sensor" | "binary_sensor" => Self::Sensor,
            "climate" => Self::Climate,
            "cover" => Self::Cover,
            "lock" => Self::Lock,
            "fan" => Self::Fan,
            "media_player" => Self::MediaPlayer,
            "vacuum" => Self::Vacuum,
            _ => Self::Other,
        }
    }
}
