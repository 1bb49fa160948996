//! Capability inference.
//!
//! Which capability a controller entity reports is decided here and only
//! here: the watcher uses it to pick an extraction rule, the default
//! mapper uses it to describe devices to the cloud.

use crate::model::CapabilityType;

/// Domains whose entities are read-only sensors; their capability comes
/// from the entity's name rather than the domain.
pub const SENSOR_DOMAINS: &[&str] = &["sensor", "binary_sensor"];

/// Primary-entity priority when a device exposes several domains.
pub const DOMAIN_PRIORITY: &[&str] = &[
    "light",
    "switch",
    "climate",
    "cover",
    "lock",
    "fan",
    "media_player",
    "vacuum",
    "input_boolean",
    "binary_sensor",
    "sensor",
];

/// Name fragments and the sensor capability each one suggests, in
/// precedence order.
const NAME_HINTS: &[(&str, CapabilityType)] = &[
    ("temp", CapabilityType::Temperature),
    ("humid", CapabilityType::Humidity),
    ("battery", CapabilityType::Battery),
    ("power", CapabilityType::Power),
    ("energy", CapabilityType::Energy),
    ("motion", CapabilityType::Motion),
    ("door", CapabilityType::Contact),
    ("window", CapabilityType::Contact),
];

/// Capabilities a controllable domain supports. The first one is the
/// domain's default.
pub fn domain_capabilities(domain: &str) -> &'static [CapabilityType] {
    use CapabilityType as C;
    match domain {
        "light" => &[C::Switch, C::Brightness, C::ColorTemperature],
        "switch" | "input_boolean" => &[C::Switch],
        "fan" => &[C::Switch, C::FanSpeed],
        "cover" => &[C::Position, C::Switch],
        "lock" => &[C::Lock],
        "climate" => &[C::TargetTemperature, C::HvacMode, C::Temperature, C::Humidity],
        "media_player" => &[C::Switch, C::Volume],
        "vacuum" => &[C::Switch, C::Battery],
        _ => &[],
    }
}

/// Rank of `domain` in [`DOMAIN_PRIORITY`]; unknown domains sort last.
pub fn domain_rank(domain: &str) -> usize {
    DOMAIN_PRIORITY
        .iter()
        .position(|d| *d == domain)
        .unwrap_or(DOMAIN_PRIORITY.len())
}

/// Domains to try, in order, when a command for `capability` names a
/// device rather than an entity.
pub fn preferred_domains(capability: CapabilityType) -> &'static [&'static str] {
    use CapabilityType as C;
    match capability {
        C::Switch => &[
            "switch",
            "light",
            "input_boolean",
            "fan",
            "media_player",
            "vacuum",
            "cover",
        ],
        C::Brightness | C::ColorTemperature => &["light"],
        C::Position => &["cover"],
        C::Lock => &["lock"],
        C::TargetTemperature | C::HvacMode => &["climate"],
        C::FanSpeed => &["fan"],
        C::Volume => &["media_player"],
        C::Temperature
        | C::Humidity
        | C::Battery
        | C::Power
        | C::Energy
        | C::Motion
        | C::Contact
        | C::Sensor => &["sensor", "binary_sensor"],
    }
}

/// Decide which capability an entity reports.
///
/// 1. Controllable domain: keep `declared` if the domain allows it, else
///    the domain's default.
/// 2. Sensor domain: the first name hint (matched against the entity id
///    and friendly name) that the device is known to expose. An empty
///    `device_capabilities` means "unknown" and accepts any hint.
/// 3. Otherwise `declared` when it is a read-only capability, else the
///    generic `sensor`.
pub fn infer_capability(
    entity_id: &str,
    friendly_name: Option<&str>,
    declared: Option<CapabilityType>,
    device_capabilities: &[CapabilityType],
) -> CapabilityType {
    let domain = hublink_api::entity_domain(entity_id);

    let allowed = domain_capabilities(domain);
    if let Some(&default) = allowed.first() {
        return declared
            .filter(|capability| allowed.contains(capability))
            .unwrap_or(default);
    }

    if SENSOR_DOMAINS.contains(&domain) {
        let haystack = format!(
            "{} {}",
            entity_id.to_lowercase(),
            friendly_name.unwrap_or_default().to_lowercase()
        );
        let hinted = NAME_HINTS
            .iter()
            .filter(|(fragment, _)| haystack.contains(fragment))
            .map(|(_, capability)| *capability)
            .find(|capability| {
                device_capabilities.is_empty() || device_capabilities.contains(capability)
            });
        if let Some(capability) = hinted {
            return capability;
        }
    }

    declared
        .filter(|capability| !capability.is_controllable())
        .unwrap_or(CapabilityType::Sensor)
}
