// ── Agent façade ──
//
// What the binary (or any embedder) talks to: sync, control, stats, and
// controller health. Every result carries a success flag and, on
// failure, a machine-checkable error body.

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use hublink_api::ControllerState;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::coordinator::SyncCoordinator;
use crate::error::CoreError;
use crate::mapper::{DefaultEntityMapper, EntityMapper};
use crate::model::{ControlResponse, DeviceControlCommand, SyncResponse, SyncStats};
use crate::port::{CloudPort, ControllerPort};

/// Called with the controller's last error message when it enters `Error`.
pub type UnhealthyHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Called when the controller link returns to `Connected` after a drop.
pub type ReconnectedCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct HealthHooks {
    unhealthy: Vec<UnhealthyHandler>,
    reconnected: Vec<ReconnectedCallback>,
}

struct AgentInner {
    controller: Arc<dyn ControllerPort>,
    coordinator: SyncCoordinator,
    hooks: Mutex<HealthHooks>,
    supervision: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

/// The sync agent: one controller, one cloud, one coordinator.
#[derive(Clone)]
pub struct SyncAgent {
    inner: Arc<AgentInner>,
}

impl SyncAgent {
    pub fn new(
        controller: Arc<dyn ControllerPort>,
        cloud: Arc<dyn CloudPort>,
        config: SyncConfig,
    ) -> Self {
        Self::with_mapper(controller, cloud, Arc::new(DefaultEntityMapper), config)
    }

    pub fn with_mapper(
        controller: Arc<dyn ControllerPort>,
        cloud: Arc<dyn CloudPort>,
        mapper: Arc<dyn EntityMapper>,
        config: SyncConfig,
    ) -> Self {
        let coordinator = SyncCoordinator::new(Arc::clone(&controller), cloud, mapper, config);
        Self {
            inner: Arc::new(AgentInner {
                controller,
                coordinator,
                hooks: Mutex::new(HealthHooks::default()),
                supervision: Mutex::new(None),
            }),
        }
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.inner.coordinator
    }

    /// Full sync against the cloud, then commit and start watching.
    pub async fn start_sync(&self, home_id: &str) -> SyncResponse {
        let coordinator = &self.inner.coordinator;
        match coordinator.full_sync(home_id).await {
            Ok(mappings) => {
                let snapshot = coordinator.initialize_from_sync(home_id, mappings).await;
                SyncResponse {
                    success: true,
                    synced_device_count: snapshot.mappings.device_count(),
                    watching: coordinator.is_watching(),
                    error: None,
                }
            }
            Err(e) => {
                warn!(home_id, error = %e, "sync failed");
                SyncResponse {
                    success: false,
                    synced_device_count: 0,
                    watching: coordinator.is_watching(),
                    error: Some(e.to_body()),
                }
            }
        }
    }

    /// Run the recovery pass by hand.
    pub async fn restore(&self) -> Result<bool, CoreError> {
        self.inner.coordinator.restore().await
    }

    pub async fn control_device(&self, command: &DeviceControlCommand) -> ControlResponse {
        self.inner.coordinator.control_device(command).await
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.inner.coordinator.stats()
    }

    pub fn on_unhealthy(&self, handler: UnhealthyHandler) {
        self.inner
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unhealthy
            .push(handler);
    }

    pub fn on_reconnected(&self, callback: ReconnectedCallback) {
        self.inner
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reconnected
            .push(callback);
    }

    /// Watch the controller link and fire health hooks. Idempotent.
    pub fn start_supervision(&self) {
        let mut supervision = self
            .inner
            .supervision
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if supervision.as_ref().is_some_and(|(_, task)| !task.is_finished()) {
            return;
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(
            self.clone(),
            self.inner.controller.state_watch(),
            self.inner.controller.session_watch(),
            cancel.clone(),
        ));
        *supervision = Some((cancel, task));
    }

    /// Stop supervision and drop the active sync.
    pub async fn shutdown(&self) {
        let supervision = self
            .inner
            .supervision
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((cancel, task)) = supervision {
            cancel.cancel();
            let _ = task.await;
        }
        self.inner.coordinator.reset().await;
    }

    fn fire_unhealthy(&self, message: &str) {
        let handlers = self
            .inner
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unhealthy
            .clone();
        for handler in handlers {
            handler(message);
        }
    }

    async fn handle_reconnected(&self) {
        let callbacks = self
            .inner
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reconnected
            .clone();

        if !callbacks.is_empty() {
            for callback in callbacks {
                callback().await;
            }
            return;
        }

        if let Some(snapshot) = self.inner.coordinator.snapshot() {
            info!(home_id = %snapshot.home_id, "controller reconnected, resyncing");
            let response = self.start_sync(&snapshot.home_id).await;
            if !response.success {
                warn!(error = ?response.error, "resync after reconnect failed");
            }
        }
    }
}

/// Fires `on_unhealthy` when the controller parks in `Error` and the
/// reconnect path once per session after the first.
async fn supervise(
    agent: SyncAgent,
    mut states: watch::Receiver<ControllerState>,
    mut sessions: watch::Receiver<u64>,
    cancel: CancellationToken,
) {
    let mut previous = *states.borrow_and_update();
    let mut seen_session = *sessions.borrow_and_update() > 0;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *states.borrow_and_update();
                if current == previous {
                    continue;
                }
                debug!(from = %previous, to = %current, "controller state changed");
                previous = current;

                if current == ControllerState::Error {
                    let message = agent
                        .inner
                        .controller
                        .last_error()
                        .map_or_else(|| "controller link failed".to_owned(), |e| e.to_string());
                    warn!(error = %message, "controller unhealthy");
                    agent.fire_unhealthy(&message);
                }
            }
            changed = sessions.changed() => {
                if changed.is_err() {
                    break;
                }
                let session = *sessions.borrow_and_update();
                if seen_session {
                    debug!(session, "controller session re-established");
                    agent.handle_reconnected().await;
                } else {
                    seen_session = true;
                }
            }
        }
    }
}
