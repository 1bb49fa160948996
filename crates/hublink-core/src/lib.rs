//! Bidirectional capability sync between a smart-home controller and a
//! cloud service, built on the two links in `hublink-api`.
//!
//! - **[`SyncAgent`]**: Façade used by the binary. [`start_sync()`](SyncAgent::start_sync)
//!   reads the controller, submits the device inventory to the cloud, and
//!   commits the confirmed mapping; [`control_device()`](SyncAgent::control_device)
//!   runs a cloud command; health hooks fire on controller failure and
//!   reconnection.
//!
//! - **[`SyncCoordinator`]**: Owns the committed [`SyncSnapshot`] and the
//!   watcher and dispatcher built from it. Serializes initialize, restore,
//!   and reset; runs the recovery pass when the cloud link reconnects.
//!
//! - **[`ChangeWatcher`]**: Controller → cloud. Turns state changes of
//!   mapped entities into `capability:changed` pushes, suppressing
//!   consecutive equal values.
//!
//! - **[`CommandDispatcher`]**: Cloud → controller. Resolves a device
//!   command to one entity and one service call.
//!
//! - **Ports** ([`ControllerPort`], [`CloudPort`]): the only way the engine
//!   reaches the links, implemented by `ControllerLink` and `CloudLink`.

pub mod agent;
pub mod capability;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod mapper;
pub mod model;
pub mod port;
pub mod watcher;

// ── Primary re-exports ──────────────────────────────────────────────
pub use agent::{ReconnectedCallback, SyncAgent, UnhealthyHandler};
pub use capability::infer_capability;
pub use config::SyncConfig;
pub use coordinator::SyncCoordinator;
pub use dispatcher::{CommandDispatcher, CommandOutcome};
pub use error::{CommandError, CoreError};
pub use mapper::{ControllerInventory, DefaultEntityMapper, DeviceEntity, DeviceRecord, EntityMapper};
pub use port::{CloudPort, ControllerPort};
pub use watcher::{ChangeWatcher, WatcherStats};

pub use model::{
    CapabilityChanged, CapabilityType, CapabilityUpdate, CapabilityValue, ControlResponse,
    DeviceControlCommand, DeviceType, EntityMapping, ErrorBody, MappingTable, SyncResponse,
    SyncSnapshot, SyncStats,
};
