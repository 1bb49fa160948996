// In-memory link doubles shared by the sync engine tests.
#![allow(dead_code, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use hublink_api::{
    AckResponder, CloudState, ControllerState, DeviceRegistryEntry, EntityRegistryEntry,
    EntityState, Error, EventHandler, HandlerId, InboundEvent, StateChange,
};
use hublink_core::{CapabilityType, CloudPort, ControllerPort, DeviceType, EntityMapping};

// ── Controller ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInvocation {
    pub domain: String,
    pub service: String,
    pub data: Option<Value>,
    pub entity_id: String,
}

pub struct MockController {
    changes: broadcast::Sender<Arc<StateChange>>,
    state: watch::Sender<ControllerState>,
    sessions: watch::Sender<u64>,
    last_error: Mutex<Option<Error>>,
    states: Mutex<Vec<EntityState>>,
    calls: Mutex<Vec<ServiceInvocation>>,
    reads: AtomicUsize,
    call_delay: Mutex<Option<Duration>>,
}

impl MockController {
    pub fn new() -> Arc<Self> {
        let (changes, _) = broadcast::channel(64);
        let (state, _) = watch::channel(ControllerState::Connected);
        let (sessions, _) = watch::channel(1);
        Arc::new(Self {
            changes,
            state,
            sessions,
            last_error: Mutex::new(None),
            states: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
            call_delay: Mutex::new(None),
        })
    }

    pub fn set_states(&self, states: Vec<EntityState>) {
        *self.states.lock().unwrap() = states;
    }

    pub fn set_call_delay(&self, delay: Duration) {
        *self.call_delay.lock().unwrap() = Some(delay);
    }

    /// Entering `Connected` from any other state starts a new session.
    pub fn set_state(&self, state: ControllerState, error: Option<Error>) {
        *self.last_error.lock().unwrap() = error;
        let previous = self.state.send_replace(state);
        if state == ControllerState::Connected && previous != ControllerState::Connected {
            self.sessions.send_modify(|n| *n += 1);
        }
    }

    /// Deliver a state change for `entity_id`.
    pub fn change(&self, entity_id: &str, state: &str, attributes: Value) {
        let new_state = entity(entity_id, state, attributes);
        let _ = self.changes.send(Arc::new(StateChange {
            entity_id: entity_id.into(),
            old_state: None,
            new_state: Some(new_state),
        }));
    }

    pub fn calls(&self) -> Vec<ServiceInvocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of `get_states` reads.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn receiver_count(&self) -> usize {
        self.changes.receiver_count()
    }
}

#[async_trait]
impl ControllerPort for MockController {
    fn state_changes(&self) -> broadcast::Receiver<Arc<StateChange>> {
        self.changes.subscribe()
    }

    fn connection_state(&self) -> ControllerState {
        *self.state.borrow()
    }

    fn state_watch(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    fn session_watch(&self) -> watch::Receiver<u64> {
        self.sessions.subscribe()
    }

    fn last_error(&self) -> Option<Error> {
        self.last_error.lock().unwrap().clone()
    }

    async fn get_states(&self) -> Result<Vec<EntityState>, Error> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.states.lock().unwrap().clone())
    }

    async fn list_entity_registry(&self) -> Result<Vec<EntityRegistryEntry>, Error> {
        Ok(Vec::new())
    }

    async fn list_device_registry(&self) -> Result<Vec<DeviceRegistryEntry>, Error> {
        Err(Error::Protocol {
            code: "unknown_command".into(),
            message: "registry not available".into(),
        })
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        service_data: Option<Value>,
        entity_id: &str,
    ) -> Result<Value, Error> {
        let delay = *self.call_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().unwrap().push(ServiceInvocation {
            domain: domain.into(),
            service: service.into(),
            data: service_data,
            entity_id: entity_id.into(),
        });
        Ok(Value::Null)
    }
}

// ── Cloud ───────────────────────────────────────────────────────────

pub struct MockCloud {
    agent_id: String,
    state: watch::Sender<CloudState>,
    sessions: watch::Sender<u64>,
    connected: AtomicBool,
    emitted: Mutex<Vec<(String, Value)>>,
    requests: Mutex<Vec<(String, Value)>>,
    responses: Mutex<HashMap<String, Value>>,
    handlers: Mutex<Vec<(HandlerId, String, EventHandler)>>,
    next_handler: AtomicU64,
    next_ack: AtomicU64,
}

impl MockCloud {
    pub fn new(agent_id: &str) -> Arc<Self> {
        let (state, _) = watch::channel(CloudState::Connected);
        let (sessions, _) = watch::channel(1);
        Arc::new(Self {
            agent_id: agent_id.into(),
            state,
            sessions,
            connected: AtomicBool::new(true),
            emitted: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            handlers: Mutex::new(Vec::new()),
            next_handler: AtomicU64::new(1),
            next_ack: AtomicU64::new(1),
        })
    }

    /// Acknowledge every future `event` request with `response`. Requests
    /// without a response time out.
    pub fn respond(&self, event: &str, response: Value) {
        self.responses.lock().unwrap().insert(event.into(), response);
    }

    /// Going from disconnected to connected starts a new session.
    pub fn set_connected(&self, connected: bool) {
        let was_connected = self.connected.swap(connected, Ordering::SeqCst);
        self.state.send_replace(if connected {
            CloudState::Connected
        } else {
            CloudState::Disconnected
        });
        if connected && !was_connected {
            self.sessions.send_modify(|n| *n += 1);
        }
    }

    pub fn emitted(&self, event: &str) -> Vec<Value> {
        self.emitted
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn requests(&self, event: &str) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }

    /// Deliver an inbound event without an ack id.
    pub fn deliver(&self, event: &str, data: Value) {
        self.dispatch(&InboundEvent {
            name: event.into(),
            data,
            ack: None,
        });
    }

    /// Deliver an inbound event expecting an ack; returns the channel the
    /// ack frame is written to.
    pub fn deliver_with_ack(&self, event: &str, data: Value) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_ack.fetch_add(1, Ordering::SeqCst);
        self.dispatch(&InboundEvent {
            name: event.into(),
            data,
            ack: Some(AckResponder::new(id, tx)),
        });
        rx
    }

    fn dispatch(&self, event: &InboundEvent) {
        let handlers: Vec<EventHandler> = self
            .handlers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, name, _)| *name == event.name)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }
}

#[async_trait]
impl CloudPort for MockCloud {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn state_watch(&self) -> watch::Receiver<CloudState> {
        self.state.subscribe()
    }

    fn session_watch(&self) -> watch::Receiver<u64> {
        self.sessions.subscribe()
    }

    fn emit(&self, event: &str, data: Value) -> Result<(), Error> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        self.emitted.lock().unwrap().push((event.into(), data));
        Ok(())
    }

    async fn emit_with_callback(
        &self,
        event: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, Error> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        self.requests.lock().unwrap().push((event.into(), data));
        let response = self.responses.lock().unwrap().get(event).cloned();
        response.ok_or(Error::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap(),
        })
    }

    fn on(&self, event: &str, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::SeqCst));
        self.handlers
            .lock()
            .unwrap()
            .push((id, event.into(), handler));
        id
    }

    fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap();
        let before = handlers.len();
        handlers.retain(|(registered, _, _)| *registered != id);
        handlers.len() != before
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

pub fn entity(entity_id: &str, state: &str, attributes: Value) -> EntityState {
    serde_json::from_value(json!({
        "entity_id": entity_id,
        "state": state,
        "attributes": attributes,
    }))
    .unwrap()
}

pub fn mapping(remote: &str, entity_id: &str, capability: CapabilityType) -> EntityMapping {
    EntityMapping {
        remote_device_id: remote.into(),
        local_device_id: format!("local-{remote}"),
        entity_id: entity_id.into(),
        capability_type: capability,
        device_type: DeviceType::Other,
    }
}

/// Parse an ack frame written by an `AckResponder`.
pub fn ack_data(frame: &Message) -> Value {
    let text = frame.to_text().unwrap();
    let envelope: Value = serde_json::from_str(text).unwrap();
    envelope["data"].clone()
}

/// Poll `condition` until it holds or a second passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
