//! Async protocol links for hublink.
//!
//! Two independent WebSocket sessions, each with its own state machine and
//! reconnection policy:
//!
//! - [`ControllerLink`]: the local controller's RPC + event protocol
//!   (`auth` handshake, id-correlated requests, event subscriptions).
//! - [`CloudLink`]: the cloud coordination service's event socket
//!   (fire-and-forget and acknowledged emits, named inbound events).
//!
//! Both reject every outstanding correlated request with
//! [`Error::ConnectionClosed`] when their socket drops. Neither queues
//! requests while disconnected.

pub mod backoff;
pub mod cloud;
pub mod controller;
pub mod error;
mod pending;
pub mod transport;

pub use backoff::{ReconnectConfig, calculate_backoff};
pub use cloud::{
    AckResponder, CloudLink, CloudLinkConfig, ConnectionState as CloudState, EventHandler,
    HandlerId, InboundEvent,
};
pub use controller::protocol::{
    ControllerCommand, ControllerEvent, DeviceRegistryEntry, EntityRegistryEntry, EntityState,
    StateChange, entity_domain,
};
pub use controller::{ConnectionState as ControllerState, ControllerLink, ControllerLinkConfig};
pub use error::Error;
pub use transport::websocket_url;
