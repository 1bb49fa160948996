// ── Capability → controller service call ──

use serde_json::{Value, json};

use crate::model::{CapabilityType, CapabilityValue};

/// One controller action, ready for `call_service`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCall {
    pub domain: String,
    pub service: &'static str,
    pub data: Option<Value>,
}

impl ServiceCall {
    fn new(domain: &str, service: &'static str) -> Self {
        Self {
            domain: domain.to_owned(),
            service,
            data: None,
        }
    }

    fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Translate a capability command for `entity_id` into a service call.
///
/// `None` means the capability cannot be applied: it is read-only, or the
/// value has the wrong shape for it.
pub fn translate(
    entity_id: &str,
    capability: CapabilityType,
    value: &CapabilityValue,
) -> Option<ServiceCall> {
    let domain = hublink_api::entity_domain(entity_id);
    let call = match capability {
        CapabilityType::Switch => switch_call(domain, value.as_bool()?),
        CapabilityType::Brightness => ServiceCall::new("light", "turn_on")
            .with_data(json!({ "brightness_pct": percent(value.as_f64()?) })),
        CapabilityType::ColorTemperature => ServiceCall::new("light", "turn_on")
            .with_data(json!({ "color_temp_kelvin": whole(value.as_f64()?) })),
        CapabilityType::Position => ServiceCall::new("cover", "set_cover_position")
            .with_data(json!({ "position": percent(value.as_f64()?) })),
        CapabilityType::Lock => {
            let service = if value.as_bool()? { "lock" } else { "unlock" };
            ServiceCall::new("lock", service)
        }
        CapabilityType::TargetTemperature => ServiceCall::new("climate", "set_temperature")
            .with_data(json!({ "temperature": value.as_f64()? })),
        CapabilityType::HvacMode => ServiceCall::new("climate", "set_hvac_mode")
            .with_data(json!({ "hvac_mode": value.as_str()? })),
        CapabilityType::FanSpeed => ServiceCall::new("fan", "set_percentage")
            .with_data(json!({ "percentage": percent(value.as_f64()?) })),
        CapabilityType::Volume => ServiceCall::new("media_player", "volume_set")
            .with_data(json!({ "volume_level": value.as_f64()?.clamp(0.0, 100.0) / 100.0 })),
        CapabilityType::Temperature
        | CapabilityType::Humidity
        | CapabilityType::Battery
        | CapabilityType::Power
        | CapabilityType::Energy
        | CapabilityType::Motion
        | CapabilityType::Contact
        | CapabilityType::Sensor => return None,
    };
    Some(call)
}

fn switch_call(domain: &str, on: bool) -> ServiceCall {
    let service = match (domain, on) {
        ("cover", true) => "open_cover",
        ("cover", false) => "close_cover",
        ("lock", true) => "lock",
        ("lock", false) => "unlock",
        ("vacuum", true) => "start",
        ("vacuum", false) => "return_to_base",
        (_, true) => "turn_on",
        (_, false) => "turn_off",
    };
    ServiceCall::new(domain, service)
}

fn percent(value: f64) -> i64 {
    whole(value.clamp(0.0, 100.0))
}

#[allow(clippy::cast_possible_truncation)]
fn whole(value: f64) -> i64 {
    value.round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn switch_follows_entity_domain() {
        let on = translate("switch.heater", CapabilityType::Switch, &true.into()).expect("call");
        assert_eq!((on.domain.as_str(), on.service), ("switch", "turn_on"));

        let cover = translate("cover.garage", CapabilityType::Switch, &false.into()).expect("call");
        assert_eq!((cover.domain.as_str(), cover.service), ("cover", "close_cover"));

        let vacuum = translate("vacuum.robot", CapabilityType::Switch, &true.into()).expect("call");
        assert_eq!(vacuum.service, "start");
    }

    #[test]
    fn brightness_and_color_target_the_light_domain() {
        let dim = translate("light.desk", CapabilityType::Brightness, &40.4.into()).expect("call");
        assert_eq!(dim.domain, "light");
        assert_eq!(dim.service, "turn_on");
        assert_eq!(dim.data, Some(json!({ "brightness_pct": 40 })));

        let warm =
            translate("light.desk", CapabilityType::ColorTemperature, &2700.0.into()).expect("call");
        assert_eq!(warm.data, Some(json!({ "color_temp_kelvin": 2700 })));
    }

    #[test]
    fn volume_scales_to_unit_interval() {
        let call = translate("media_player.den", CapabilityType::Volume, &35.0.into()).expect("call");
        assert_eq!(call.service, "volume_set");
        assert_eq!(call.data, Some(json!({ "volume_level": 0.35 })));
    }

    #[test]
    fn wrong_shape_or_read_only_is_untranslatable() {
        assert_eq!(
            translate("light.desk", CapabilityType::Brightness, &"bright".into()),
            None
        );
        assert_eq!(
            translate("switch.heater", CapabilityType::Switch, &1.0.into()),
            None
        );
        assert_eq!(
            translate("sensor.outdoor", CapabilityType::Temperature, &21.0.into()),
            None
        );
    }

    #[test]
    fn climate_calls_carry_values() {
        let mode = translate("climate.hall", CapabilityType::HvacMode, &"heat".into()).expect("call");
        assert_eq!(mode.service, "set_hvac_mode");
        assert_eq!(mode.data, Some(json!({ "hvac_mode": "heat" })));

        let target =
            translate("climate.hall", CapabilityType::TargetTemperature, &21.5.into()).expect("call");
        assert_eq!(target.data, Some(json!({ "temperature": 21.5 })));
    }
}
