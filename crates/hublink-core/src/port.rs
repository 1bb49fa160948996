// ── Link ports ──
//
// The sync engine reaches both links only through these traits, so the
// watcher, dispatcher, and coordinator run unchanged against in-memory
// doubles. `ControllerLink` and `CloudLink` implement them directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hublink_api::{
    CloudLink, CloudState, ControllerLink, ControllerState, DeviceRegistryEntry,
    EntityRegistryEntry, EntityState, EventHandler, HandlerId, StateChange,
};
use serde_json::Value;
use tokio::sync::{broadcast, watch};

/// What the engine needs from the controller session.
#[async_trait]
pub trait ControllerPort: Send + Sync {
    fn state_changes(&self) -> broadcast::Receiver<Arc<StateChange>>;

    fn connection_state(&self) -> ControllerState;

    fn state_watch(&self) -> watch::Receiver<ControllerState>;

    /// Changes once per session that reaches `Connected`.
    fn session_watch(&self) -> watch::Receiver<u64>;

    fn last_error(&self) -> Option<hublink_api::Error>;

    async fn get_states(&self) -> Result<Vec<EntityState>, hublink_api::Error>;

    async fn list_entity_registry(&self) -> Result<Vec<EntityRegistryEntry>, hublink_api::Error>;

    async fn list_device_registry(&self) -> Result<Vec<DeviceRegistryEntry>, hublink_api::Error>;

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        service_data: Option<Value>,
        entity_id: &str,
    ) -> Result<Value, hublink_api::Error>;
}

/// What the engine needs from the cloud session.
#[async_trait]
pub trait CloudPort: Send + Sync {
    fn agent_id(&self) -> &str;

    fn state_watch(&self) -> watch::Receiver<CloudState>;

    /// Changes once per session that reaches `Connected`.
    fn session_watch(&self) -> watch::Receiver<u64>;

    fn emit(&self, event: &str, data: Value) -> Result<(), hublink_api::Error>;

    async fn emit_with_callback(
        &self,
        event: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, hublink_api::Error>;

    fn on(&self, event: &str, handler: EventHandler) -> HandlerId;

    fn off(&self, id: HandlerId) -> bool;
}

#[async_trait]
impl ControllerPort for ControllerLink {
    fn state_changes(&self) -> broadcast::Receiver<Arc<StateChange>> {
        ControllerLink::state_changes(self)
    }

    fn connection_state(&self) -> ControllerState {
        ControllerLink::connection_state(self)
    }

    fn state_watch(&self) -> watch::Receiver<ControllerState> {
        ControllerLink::state_watch(self)
    }

    fn session_watch(&self) -> watch::Receiver<u64> {
        ControllerLink::session_watch(self)
    }

    fn last_error(&self) -> Option<hublink_api::Error> {
        ControllerLink::last_error(self)
    }

    async fn get_states(&self) -> Result<Vec<EntityState>, hublink_api::Error> {
        ControllerLink::get_states(self).await
    }

    async fn list_entity_registry(&self) -> Result<Vec<EntityRegistryEntry>, hublink_api::Error> {
        ControllerLink::list_entity_registry(self).await
    }

    async fn list_device_registry(&self) -> Result<Vec<DeviceRegistryEntry>, hublink_api::Error> {
        ControllerLink::list_device_registry(self).await
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        service_data: Option<Value>,
        entity_id: &str,
    ) -> Result<Value, hublink_api::Error> {
        ControllerLink::call_service(self, domain, service, service_data, Some(entity_id)).await
    }
}

#[async_trait]
impl CloudPort for CloudLink {
    fn agent_id(&self) -> &str {
        CloudLink::agent_id(self)
    }

    fn state_watch(&self) -> watch::Receiver<CloudState> {
        CloudLink::state_watch(self)
    }

    fn session_watch(&self) -> watch::Receiver<u64> {
        CloudLink::session_watch(self)
    }

    fn emit(&self, event: &str, data: Value) -> Result<(), hublink_api::Error> {
        CloudLink::emit(self, event, data)
    }

    async fn emit_with_callback(
        &self,
        event: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, hublink_api::Error> {
        CloudLink::emit_with_callback(self, event, data, timeout).await
    }

    fn on(&self, event: &str, handler: EventHandler) -> HandlerId {
        CloudLink::on(self, event, move |inbound| handler(inbound))
    }

    fn off(&self, id: HandlerId) -> bool {
        CloudLink::off(self, id)
    }
}
