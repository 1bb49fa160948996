// ── State → capability value ──
//
// One rule per capability. `None` means "nothing worth pushing": the
// entity is unavailable, or the attribute the rule needs is missing.

use hublink_api::EntityState;

use crate::model::{CapabilityType, CapabilityValue};

const ON_STATES: &[&str] = &["on", "playing", "cleaning"];

pub fn extract_value(capability: CapabilityType, state: &EntityState) -> Option<CapabilityValue> {
    if state.is_unavailable() {
        return None;
    }

    let value = match capability {
        CapabilityType::Switch => CapabilityValue::Bool(ON_STATES.contains(&state.state.as_str())),
        CapabilityType::Brightness => CapabilityValue::Number(brightness_pct(state)?),
        CapabilityType::ColorTemperature => CapabilityValue::Number(color_temp_kelvin(state)?),
        CapabilityType::Temperature
        | CapabilityType::Humidity
        | CapabilityType::Battery
        | CapabilityType::Power
        | CapabilityType::Energy => CapabilityValue::Number(numeric_reading(capability, state)?),
        CapabilityType::Motion | CapabilityType::Contact => {
            CapabilityValue::Bool(state.state == "on")
        }
        CapabilityType::Position => {
            CapabilityValue::Number(state.attribute_f64("current_position")?)
        }
        CapabilityType::Lock => CapabilityValue::Bool(state.state == "locked"),
        CapabilityType::TargetTemperature => {
            CapabilityValue::Number(state.attribute_f64("temperature")?)
        }
        CapabilityType::FanSpeed => CapabilityValue::Number(state.attribute_f64("percentage")?),
        CapabilityType::Volume => {
            CapabilityValue::Number((state.attribute_f64("volume_level")? * 100.0).round())
        }
        CapabilityType::HvacMode | CapabilityType::Sensor => {
            CapabilityValue::Text(state.state.clone())
        }
    };
    Some(value)
}

/// Raw 0–255 brightness as a rounded percentage. An `off` light is 0.
fn brightness_pct(state: &EntityState) -> Option<f64> {
    if state.state == "off" {
        return Some(0.0);
    }
    let raw = state.attribute_f64("brightness")?;
    Some((raw.clamp(0.0, 255.0) / 255.0 * 100.0).round())
}

/// Prefer the Kelvin attribute; otherwise convert mireds.
fn color_temp_kelvin(state: &EntityState) -> Option<f64> {
    if let Some(kelvin) = state.attribute_f64("color_temp_kelvin") {
        return Some(kelvin.round());
    }
    let mireds = state.attribute_f64("color_temp")?;
    (mireds > 0.0).then(|| (1_000_000.0 / mireds).round())
}

/// Sensors carry the reading as their state. Climate entities carry a
/// mode as state, so fall back to the matching `current_*` attribute.
fn numeric_reading(capability: CapabilityType, state: &EntityState) -> Option<f64> {
    if let Some(reading) = state
        .state
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
    {
        return Some(reading);
    }
    match capability {
        CapabilityType::Temperature => state.attribute_f64("current_temperature"),
        CapabilityType::Humidity => state.attribute_f64("current_humidity"),
        CapabilityType::Battery => state.attribute_f64("battery_level"),
        _ => None,
    }
}
