//! TCP bridge for device nodes: newline-delimited JSON framing, pairing
//! handshake, and command invocation over live connections.

pub mod events;
pub mod registry;
pub mod server;

pub use {
    events::BridgeEvents,
    registry::{InvokeError, NodeSession},
    server::{BridgeHandle, BridgeServer},
};
