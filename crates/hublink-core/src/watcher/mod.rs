// ── Controller → cloud change watcher ──
//
// Consumes the controller's state-change stream from a single task (so
// changes are handled in delivery order), turns tracked entities' states
// into capability values, and pushes `capability:changed` to the cloud.
// Consecutive equal values per entity are suppressed.

pub mod extract;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use chrono::Utc;
use dashmap::DashMap;
use hublink_api::StateChange;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::capability::infer_capability;
use crate::model::{CapabilityChanged, CapabilityType, CapabilityValue, MappingTable};
use crate::port::{CloudPort, ControllerPort};

pub use extract::extract_value;

pub const CAPABILITY_CHANGED: &str = "capability:changed";

/// Counters since the last `initialize`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatcherStats {
    pub events_received: u64,
    pub updates_skipped: u64,
    pub updates_deduped: u64,
    pub updates_sent: u64,
    pub updates_failed: u64,
}

/// A tracked entity: where its pushes go and how its value is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedEntity {
    pub remote_device_id: String,
    pub capability: CapabilityType,
}

#[derive(Debug, Default)]
struct WatchSet {
    home_id: String,
    generation: u64,
    tracked: HashMap<String, TrackedEntity>,
}

impl WatchSet {
    fn build(home_id: &str, mappings: &MappingTable, generation: u64) -> Self {
        let mut by_device: HashMap<&str, Vec<CapabilityType>> = HashMap::new();
        for mapping in mappings.iter() {
            by_device
                .entry(mapping.remote_device_id.as_str())
                .or_default()
                .push(mapping.capability_type);
        }

        let tracked = mappings
            .iter()
            .map(|mapping| {
                let known = by_device
                    .get(mapping.remote_device_id.as_str())
                    .map_or(&[][..], Vec::as_slice);
                let capability = infer_capability(
                    &mapping.entity_id,
                    None,
                    Some(mapping.capability_type),
                    known,
                );
                (
                    mapping.entity_id.clone(),
                    TrackedEntity {
                        remote_device_id: mapping.remote_device_id.clone(),
                        capability,
                    },
                )
            })
            .collect();

        Self {
            home_id: home_id.to_owned(),
            generation,
            tracked,
        }
    }
}

#[derive(Default)]
struct Counters {
    events_received: AtomicU64,
    updates_skipped: AtomicU64,
    updates_deduped: AtomicU64,
    updates_sent: AtomicU64,
    updates_failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> WatcherStats {
        WatcherStats {
            events_received: self.events_received.load(Ordering::Relaxed),
            updates_skipped: self.updates_skipped.load(Ordering::Relaxed),
            updates_deduped: self.updates_deduped.load(Ordering::Relaxed),
            updates_sent: self.updates_sent.load(Ordering::Relaxed),
            updates_failed: self.updates_failed.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.events_received,
            &self.updates_skipped,
            &self.updates_deduped,
            &self.updates_sent,
            &self.updates_failed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct WatcherInner {
    controller: Arc<dyn ControllerPort>,
    cloud: Arc<dyn CloudPort>,
    watch_set: ArcSwap<WatchSet>,
    last_sent: DashMap<String, CapabilityValue>,
    counters: Counters,
}

struct WatcherTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Pushes controller state changes for mapped entities to the cloud.
pub struct ChangeWatcher {
    inner: Arc<WatcherInner>,
    task: Mutex<Option<WatcherTask>>,
}

impl ChangeWatcher {
    pub fn new(controller: Arc<dyn ControllerPort>, cloud: Arc<dyn CloudPort>) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                controller,
                cloud,
                watch_set: ArcSwap::from_pointee(WatchSet::default()),
                last_sent: DashMap::new(),
                counters: Counters::default(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Replace the tracked set. Clears the dedup cache and counters.
    pub fn initialize(&self, home_id: &str, mappings: &MappingTable, generation: u64) {
        let watch_set = WatchSet::build(home_id, mappings, generation);
        debug!(
            home_id,
            generation,
            tracked = watch_set.tracked.len(),
            "watcher initialized"
        );
        self.inner.watch_set.store(Arc::new(watch_set));
        self.inner.last_sent.clear();
        self.inner.counters.reset();
    }

    /// Attach to the controller's change stream. Returns `false` (and does
    /// nothing) when already running or when nothing is tracked.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            info!("watcher already running");
            return false;
        }
        let tracked = self.inner.watch_set.load().tracked.len();
        if tracked == 0 {
            info!("watcher has no mapped entities, not starting");
            return false;
        }

        // Subscribe before spawning so no change slips between the two.
        let rx = self.inner.controller.state_changes();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watch_task(Arc::clone(&self.inner), rx, cancel.clone()));
        *task = Some(WatcherTask { cancel, handle });

        info!(tracked, "watcher started");
        true
    }

    /// Detach from the change stream. Idempotent.
    pub fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.cancel.cancel();
            task.handle.abort();
            debug!("watcher stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    pub fn stats(&self) -> WatcherStats {
        self.inner.counters.snapshot()
    }

    pub fn generation(&self) -> u64 {
        self.inner.watch_set.load().generation
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.watch_set.load().tracked.len()
    }

    /// How a tracked entity is read, if it is tracked.
    pub fn tracked(&self, entity_id: &str) -> Option<TrackedEntity> {
        self.inner.watch_set.load().tracked.get(entity_id).cloned()
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn watch_task(
    inner: Arc<WatcherInner>,
    mut rx: broadcast::Receiver<Arc<StateChange>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = rx.recv() => match result {
                Ok(change) => inner.handle_change(&change),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "watcher lagged behind controller changes");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("controller change stream closed");
                    break;
                }
            }
        }
    }
}

impl WatcherInner {
    fn handle_change(&self, change: &StateChange) {
        let watch_set = self.watch_set.load();
        let Some(tracked) = watch_set.tracked.get(&change.entity_id) else {
            return;
        };
        Counters::bump(&self.counters.events_received);

        let value = change
            .new_state
            .as_ref()
            .and_then(|state| extract_value(tracked.capability, state));
        let Some(value) = value else {
            trace!(entity_id = %change.entity_id, "no extractable value");
            Counters::bump(&self.counters.updates_skipped);
            return;
        };

        let unchanged = self
            .last_sent
            .get(&change.entity_id)
            .is_some_and(|last| last.approx_eq(&value));
        if unchanged {
            Counters::bump(&self.counters.updates_skipped);
            Counters::bump(&self.counters.updates_deduped);
            return;
        }

        let payload = CapabilityChanged {
            home_id: watch_set.home_id.clone(),
            device_id: tracked.remote_device_id.clone(),
            entity_id: change.entity_id.clone(),
            capability_type: tracked.capability,
            value: value.clone(),
            source: self.cloud.agent_id().to_owned(),
            timestamp: Utc::now(),
        };
        let data = match serde_json::to_value(&payload) {
            Ok(data) => data,
            Err(e) => {
                warn!(entity_id = %change.entity_id, error = %e, "failed to encode capability change");
                Counters::bump(&self.counters.updates_failed);
                return;
            }
        };

        match self.cloud.emit(CAPABILITY_CHANGED, data) {
            Ok(()) => {
                debug!(
                    entity_id = %change.entity_id,
                    capability = %tracked.capability,
                    "pushed capability change"
                );
                self.last_sent.insert(change.entity_id.clone(), value);
                Counters::bump(&self.counters.updates_sent);
            }
            Err(e) => {
                debug!(entity_id = %change.entity_id, error = %e, "capability push failed");
                Counters::bump(&self.counters.updates_failed);
            }
        }
    }
}
