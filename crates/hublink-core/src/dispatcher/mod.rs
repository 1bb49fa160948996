// ── Cloud → controller command dispatcher ──
//
// Built from one mapping generation and never mutated afterwards; the
// coordinator swaps in a new dispatcher on every re-initialize.

pub mod translate;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::capability::{domain_rank, preferred_domains};
use crate::error::CommandError;
use crate::model::{
    CapabilityType, ControlResponse, DeviceControlCommand, ErrorBody, MappingTable,
};
use crate::port::ControllerPort;

pub use translate::{ServiceCall, translate};

/// A successfully executed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub entity_id: String,
    pub message: String,
}

#[derive(Debug, Default)]
struct DeviceEntry {
    /// Mapped entities in mapping order.
    entities: Vec<String>,
    /// Highest-priority entity by domain.
    primary: Option<String>,
}

/// Resolves control commands to entities and executes them on the
/// controller.
pub struct CommandDispatcher {
    controller: Arc<dyn ControllerPort>,
    mappings: Arc<MappingTable>,
    generation: u64,
    command_timeout: Duration,
    devices: HashMap<String, DeviceEntry>,
    local_to_remote: HashMap<String, String>,
}

impl CommandDispatcher {
    pub fn new(
        controller: Arc<dyn ControllerPort>,
        mappings: Arc<MappingTable>,
        generation: u64,
        command_timeout: Duration,
    ) -> Self {
        let mut devices: HashMap<String, DeviceEntry> = HashMap::new();
        let mut local_to_remote = HashMap::new();
        for mapping in mappings.iter() {
            devices
                .entry(mapping.remote_device_id.clone())
                .or_default()
                .entities
                .push(mapping.entity_id.clone());
            local_to_remote
                .entry(mapping.local_device_id.clone())
                .or_insert_with(|| mapping.remote_device_id.clone());
        }
        for device in devices.values_mut() {
            // `min_by_key` keeps the first of equal ranks: mapping order breaks ties.
            device.primary = device
                .entities
                .iter()
                .min_by_key(|entity| domain_rank(hublink_api::entity_domain(entity)))
                .cloned();
        }

        Self {
            controller,
            mappings,
            generation,
            command_timeout,
            devices,
            local_to_remote,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn mappings(&self) -> &MappingTable {
        &self.mappings
    }

    /// Pick the entity a command acts on.
    ///
    /// Explicit entity id, else the device's first entity in a domain the
    /// capability prefers, else the device's primary entity, else the
    /// device id itself when it is shaped like an entity id.
    pub fn resolve_entity(
        &self,
        device_id: &str,
        entity_id: Option<&str>,
        capability: CapabilityType,
    ) -> Result<String, CommandError> {
        if let Some(entity_id) = entity_id.filter(|id| !id.is_empty()) {
            return Ok(entity_id.to_owned());
        }

        let device = self.devices.get(device_id).or_else(|| {
            self.local_to_remote
                .get(device_id)
                .and_then(|remote| self.devices.get(remote))
        });

        if let Some(device) = device {
            let preferred = preferred_domains(capability);
            let chosen = device
                .entities
                .iter()
                .find(|entity| preferred.contains(&hublink_api::entity_domain(entity)))
                .or(device.primary.as_ref());
            if let Some(entity) = chosen {
                return Ok(entity.clone());
            }
        }

        if looks_like_entity_id(device_id) {
            return Ok(device_id.to_owned());
        }

        Err(CommandError::DeviceNotFound {
            device_id: device_id.to_owned(),
        })
    }

    /// Resolve, translate, and run one command, bounded by the command
    /// timeout.
    pub async fn execute(
        &self,
        command: &DeviceControlCommand,
    ) -> Result<CommandOutcome, CommandError> {
        let entity_id = self.resolve_entity(
            &command.device_id,
            command.entity_id.as_deref(),
            command.capability_type,
        )?;

        let call = translate(&entity_id, command.capability_type, &command.value).ok_or_else(
            || CommandError::UnsupportedCapability {
                entity_id: entity_id.clone(),
                capability: command.capability_type,
            },
        )?;

        debug!(
            device_id = %command.device_id,
            entity_id = %entity_id,
            service = %format!("{}.{}", call.domain, call.service),
            "executing command"
        );

        let result = tokio::time::timeout(
            self.command_timeout,
            self.controller
                .call_service(&call.domain, call.service, call.data, &entity_id),
        )
        .await;

        match result {
            Ok(Ok(_)) => Ok(CommandOutcome {
                message: format!("{}.{} called on {entity_id}", call.domain, call.service),
                entity_id,
            }),
            Ok(Err(e)) => {
                warn!(entity_id = %entity_id, error = %e, "service call failed");
                Err(CommandError::ExecutionFailed {
                    message: e.to_string(),
                })
            }
            Err(_) => {
                let timeout_ms =
                    u64::try_from(self.command_timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(entity_id = %entity_id, timeout_ms, "service call timed out");
                Err(CommandError::ExecutionFailed {
                    message: format!("service call timed out after {timeout_ms}ms"),
                })
            }
        }
    }

    /// [`execute`](Self::execute) folded into the cloud's response shape.
    pub async fn control(&self, command: &DeviceControlCommand) -> ControlResponse {
        match self.execute(command).await {
            Ok(outcome) => ControlResponse {
                success: true,
                device_id: command.device_id.clone(),
                entity_id: Some(outcome.entity_id),
                message: outcome.message,
                error: None,
            },
            Err(e) => ControlResponse::failed(
                command.device_id.clone(),
                ErrorBody::new(e.code(), e.to_string()),
            ),
        }
    }
}

/// `domain.object_id`, both parts non-empty.
fn looks_like_entity_id(id: &str) -> bool {
    id.split_once('.').is_some_and(|(domain, object)| {
        !domain.is_empty()
            && !object.is_empty()
            && domain
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    })
}
