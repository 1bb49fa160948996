// ── Sync coordinator ──
//
// Owns the active sync: snapshot, watcher, and dispatcher, always built
// together from one mapping generation and swapped as a unit. Every
// transition (initialize, restore, reset) runs under one async mutex.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use chrono::Utc;
use hublink_api::{EventHandler, HandlerId, InboundEvent};
use serde_json::json;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SyncConfig;
use crate::dispatcher::CommandDispatcher;
use crate::error::CoreError;
use crate::mapper::{ControllerInventory, EntityMapper};
use crate::model::command::{AgentDevicesResponse, AgentSyncRequest, AgentSyncResponse};
use crate::model::{
    CapabilityUpdate, ControlResponse, DeviceControlCommand, EntityMapping, ErrorBody,
    MappingTable, SyncSnapshot, SyncStats,
};
use crate::port::{CloudPort, ControllerPort};
use crate::watcher::ChangeWatcher;

pub const CAPABILITY_UPDATE: &str = "capability:update";
pub const DEVICE_CONTROL: &str = "device:control";
pub const AGENT_SYNC: &str = "agent:sync";
pub const AGENT_DEVICES: &str = "agent:devices";

/// Watcher and dispatcher of one generation, with the snapshot they were
/// built from.
struct ActiveSync {
    snapshot: SyncSnapshot,
    watcher: ChangeWatcher,
    dispatcher: Arc<CommandDispatcher>,
}

/// State only touched while holding the transition lock.
#[derive(Default)]
struct Registrations {
    handlers: Vec<HandlerId>,
    /// Cancels the auto-restore supervisor.
    restore: Option<CancellationToken>,
}

struct CoordinatorInner {
    controller: Arc<dyn ControllerPort>,
    cloud: Arc<dyn CloudPort>,
    mapper: Arc<dyn EntityMapper>,
    config: SyncConfig,
    active: ArcSwapOption<ActiveSync>,
    generation: AtomicU64,
    transition: Mutex<Registrations>,
}

/// Drives sync between the controller and the cloud.
///
/// Cheaply cloneable; clones share state.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SyncCoordinator {
    pub fn new(
        controller: Arc<dyn ControllerPort>,
        cloud: Arc<dyn CloudPort>,
        mapper: Arc<dyn EntityMapper>,
        config: SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                controller,
                cloud,
                mapper,
                config,
                active: ArcSwapOption::empty(),
                generation: AtomicU64::new(0),
                transition: Mutex::new(Registrations::default()),
            }),
        }
    }

    /// The committed snapshot, if synced.
    pub fn snapshot(&self) -> Option<SyncSnapshot> {
        self.inner
            .active
            .load()
            .as_ref()
            .map(|active| active.snapshot.clone())
    }

    pub fn is_synced(&self) -> bool {
        self.inner.active.load().is_some()
    }

    pub fn is_watching(&self) -> bool {
        self.inner
            .active
            .load()
            .as_ref()
            .is_some_and(|active| active.watcher.is_running())
    }

    /// Generations of the active watcher and dispatcher.
    pub fn active_generations(&self) -> Option<(u64, u64)> {
        self.inner
            .active
            .load()
            .as_ref()
            .map(|active| (active.watcher.generation(), active.dispatcher.generation()))
    }

    pub fn stats(&self) -> SyncStats {
        let guard = self.inner.active.load();
        let Some(active) = guard.as_ref() else {
            return SyncStats::default();
        };
        let watcher = active.watcher.stats();
        SyncStats {
            active: true,
            home_id: Some(active.snapshot.home_id.clone()),
            generation: active.snapshot.generation,
            mapping_count: active.snapshot.mappings.len(),
            events_received: watcher.events_received,
            updates_skipped: watcher.updates_skipped,
            updates_deduped: watcher.updates_deduped,
            updates_sent: watcher.updates_sent,
            updates_failed: watcher.updates_failed,
        }
    }

    /// Commit a server-confirmed mapping: replace snapshot, watcher, and
    /// dispatcher, and make sure the cloud handlers are registered.
    pub async fn initialize_from_sync(
        &self,
        home_id: &str,
        mappings: Vec<EntityMapping>,
    ) -> SyncSnapshot {
        let mut registrations = self.inner.transition.lock().await;
        self.install(&mut registrations, home_id, MappingTable::new(mappings))
    }

    /// Read the controller, submit `agent:sync`, and return the mapping
    /// the cloud confirmed. Commits nothing.
    pub async fn full_sync(&self, home_id: &str) -> Result<Vec<EntityMapping>, CoreError> {
        let inner = &self.inner;
        let (states, entities, devices) = tokio::join!(
            inner.controller.get_states(),
            inner.controller.list_entity_registry(),
            inner.controller.list_device_registry(),
        );
        let states = states?;
        // Registries only refine grouping and naming; states alone still
        // describe every entity.
        let entities = entities.unwrap_or_else(|e| {
            warn!(error = %e, "entity registry unavailable, grouping by entity");
            Vec::new()
        });
        let devices = devices.unwrap_or_else(|e| {
            warn!(error = %e, "device registry unavailable");
            Vec::new()
        });

        let inventory = ControllerInventory {
            states,
            entities,
            devices,
        };
        let records = inner.mapper.map_inventory(&inventory);
        info!(
            home_id,
            entities = inventory.states.len(),
            devices = records.len(),
            "submitting sync"
        );

        let request = AgentSyncRequest {
            agent_id: inner.cloud.agent_id(),
            home_id,
            devices: &records,
        };
        let data = serde_json::to_value(&request)?;
        let ack = inner
            .cloud
            .emit_with_callback(AGENT_SYNC, data, inner.config.submit_timeout)
            .await?;
        let response: AgentSyncResponse = serde_json::from_value(ack)?;
        if !response.success {
            return Err(CoreError::Protocol {
                code: "sync_rejected".into(),
                message: response
                    .message
                    .unwrap_or_else(|| "cloud rejected the sync".into()),
            });
        }

        debug!(mappings = response.mappings.len(), "sync confirmed");
        Ok(response.mappings)
    }

    /// Recovery pass after the cloud link comes back.
    ///
    /// Asks the cloud which devices it has on file for this agent. None:
    /// local state is cleared and `Ok(false)` is returned without touching
    /// the controller. Some: one full sync and one re-initialize, then
    /// `Ok(true)`. On failure the prior state is left as it was.
    pub async fn restore(&self) -> Result<bool, CoreError> {
        let mut registrations = self.inner.transition.lock().await;
        let inner = &self.inner;

        let on_file = async {
            let ack = inner
                .cloud
                .emit_with_callback(
                    AGENT_DEVICES,
                    json!({ "agentId": inner.cloud.agent_id() }),
                    inner.config.restore_timeout,
                )
                .await?;
            Ok::<_, CoreError>(serde_json::from_value::<AgentDevicesResponse>(ack)?)
        }
        .await
        .map_err(|e| CoreError::restore_failed(&e))?;

        if on_file.devices.is_empty() {
            info!("cloud has no devices on file for this agent, clearing local sync");
            self.clear(&mut registrations);
            return Ok(false);
        }

        let home_id = on_file
            .home_id
            .or_else(|| self.snapshot().map(|snapshot| snapshot.home_id))
            .ok_or_else(|| CoreError::RestoreFailed {
                message: "cloud reported devices without a home id".into(),
            })?;

        let mappings = self
            .full_sync(&home_id)
            .await
            .map_err(|e| CoreError::restore_failed(&e))?;
        let snapshot = self.install(&mut registrations, &home_id, MappingTable::new(mappings));
        info!(
            home_id = %snapshot.home_id,
            generation = snapshot.generation,
            "sync restored"
        );
        Ok(true)
    }

    /// Drop the active sync and every registration. Idempotent.
    pub async fn reset(&self) {
        let mut registrations = self.inner.transition.lock().await;
        self.clear(&mut registrations);
    }

    /// Run a control command against the active dispatcher.
    pub async fn control_device(&self, command: &DeviceControlCommand) -> ControlResponse {
        let Some(active) = self.inner.active.load_full() else {
            return ControlResponse::failed(
                command.device_id.clone(),
                CoreError::NotSynced.to_body(),
            );
        };
        active.dispatcher.control(command).await
    }

    // ── Transitions (caller holds the lock) ─────────────────────────

    fn install(
        &self,
        registrations: &mut Registrations,
        home_id: &str,
        table: MappingTable,
    ) -> SyncSnapshot {
        let inner = &self.inner;
        let generation = inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mappings = Arc::new(table);

        let watcher = ChangeWatcher::new(Arc::clone(&inner.controller), Arc::clone(&inner.cloud));
        watcher.initialize(home_id, &mappings, generation);
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&inner.controller),
            Arc::clone(&mappings),
            generation,
            inner.config.command_timeout,
        ));
        let snapshot = SyncSnapshot {
            home_id: home_id.to_owned(),
            mappings,
            created_at: Utc::now(),
            generation,
        };

        if let Some(previous) = inner.active.load_full() {
            previous.watcher.stop();
        }
        let active = Arc::new(ActiveSync {
            snapshot: snapshot.clone(),
            watcher,
            dispatcher,
        });
        inner.active.store(Some(Arc::clone(&active)));
        active.watcher.start();

        if registrations.handlers.is_empty() {
            registrations.handlers = vec![
                inner
                    .cloud
                    .on(CAPABILITY_UPDATE, capability_update_handler(&self.inner)),
                inner
                    .cloud
                    .on(DEVICE_CONTROL, device_control_handler(&self.inner)),
            ];
        }
        if inner.config.auto_restore && registrations.restore.is_none() {
            let cancel = CancellationToken::new();
            tokio::spawn(restore_supervisor(
                Arc::downgrade(&self.inner),
                inner.cloud.session_watch(),
                cancel.clone(),
            ));
            registrations.restore = Some(cancel);
        }

        info!(
            home_id,
            generation,
            mappings = snapshot.mappings.len(),
            devices = snapshot.mappings.device_count(),
            "sync initialized"
        );
        snapshot
    }

    fn clear(&self, registrations: &mut Registrations) {
        for id in registrations.handlers.drain(..) {
            self.inner.cloud.off(id);
        }
        // Not awaited: the supervisor may be the caller.
        if let Some(cancel) = registrations.restore.take() {
            cancel.cancel();
        }
        if let Some(previous) = self.inner.active.swap(None) {
            previous.watcher.stop();
            info!(generation = previous.snapshot.generation, "sync reset");
        }
    }
}

// ── Cloud event handlers ─────────────────────────────────────────────

fn capability_update_handler(inner: &Arc<CoordinatorInner>) -> EventHandler {
    let weak = Arc::downgrade(inner);
    let agent_id = inner.cloud.agent_id().to_owned();
    Arc::new(move |event: &InboundEvent| {
        let update: CapabilityUpdate = match serde_json::from_value(event.data.clone()) {
            Ok(update) => update,
            Err(e) => {
                warn!(error = %e, "malformed capability update");
                return;
            }
        };
        if update.source.as_deref() == Some(agent_id.as_str()) {
            trace!(device_id = %update.device_id, "ignoring echo of our own update");
            return;
        }
        let Some(active) = weak.upgrade().and_then(|inner| inner.active.load_full()) else {
            debug!("capability update with no active sync");
            return;
        };

        let command = update.into_command();
        tokio::spawn(async move {
            if let Err(e) = active.dispatcher.execute(&command).await {
                warn!(device_id = %command.device_id, error = %e, "capability update not applied");
            }
        });
    })
}

fn device_control_handler(inner: &Arc<CoordinatorInner>) -> EventHandler {
    let weak = Arc::downgrade(inner);
    Arc::new(move |event: &InboundEvent| {
        let parsed = serde_json::from_value::<DeviceControlCommand>(event.data.clone());
        let active = weak.upgrade().and_then(|inner| inner.active.load_full());
        let ack = event.ack.clone();
        let device_id = event
            .data
            .get("deviceId")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_owned();

        tokio::spawn(async move {
            let response = match (parsed, active) {
                (Err(e), _) => ControlResponse::failed(
                    device_id,
                    ErrorBody::new("invalid_command", e.to_string()),
                ),
                (Ok(command), None) => {
                    ControlResponse::failed(command.device_id, CoreError::NotSynced.to_body())
                }
                (Ok(command), Some(active)) => active.dispatcher.control(&command).await,
            };
            let Some(ack) = ack else {
                return;
            };
            match serde_json::to_value(&response) {
                Ok(data) => {
                    if let Err(e) = ack.respond(data) {
                        debug!(error = %e, "control response not delivered");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode control response"),
            }
        });
    })
}

// ── Auto-restore ─────────────────────────────────────────────────────

/// Runs the recovery pass once per new cloud session. Sessions that
/// start while a pass is in flight are picked up as soon as it returns.
async fn restore_supervisor(
    coordinator: Weak<CoordinatorInner>,
    mut sessions: watch::Receiver<u64>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = sessions.changed() => {
                if changed.is_err() {
                    break;
                }
                let session = *sessions.borrow_and_update();
                let Some(inner) = coordinator.upgrade() else {
                    break;
                };
                let coordinator = SyncCoordinator { inner };
                if coordinator.is_synced() {
                    info!(session, "cloud link reconnected, restoring sync");
                    match coordinator.restore().await {
                        Ok(true) => {}
                        Ok(false) => info!("nothing to restore"),
                        Err(e) => warn!(error = %e, "sync restore failed"),
                    }
                }
            }
        }
    }
    debug!("restore supervisor stopped");
}
