//! Connection Registry & Fan-out
//!
//! Live client channels keyed by subscriber, a bounded dispatch pool that
//! decouples slow transports from the callers, and the WebSocket endpoint
//! that feeds the registry.

mod connection;
mod dispatch;
mod registry;
mod server;

pub use connection::{Connection, ConnectionState, DeliveryError, MessageSink, WsSink};
pub use dispatch::{DispatchError, Dispatcher};
pub use registry::{ConnectionRegistry, SendOutcome};
pub use server::{subscriber_from_params, GatewayServer, EVENTS_PATH};
