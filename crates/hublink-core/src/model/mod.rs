// ── Domain model ──
//
// Pure data: no I/O, no channels. Shared by the watcher, dispatcher,
// coordinator, and the binary's output layer.

pub mod capability;
pub mod command;
pub mod mapping;

pub use capability::{CapabilityType, CapabilityValue, DeviceType, NUMERIC_EPSILON};
pub use command::{
    CapabilityChanged, CapabilityUpdate, ControlResponse, DeviceControlCommand, ErrorBody,
    SyncResponse, SyncStats,
};
pub use mapping::{EntityMapping, MappingTable, SyncSnapshot};
