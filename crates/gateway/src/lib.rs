//! The operator-facing gateway: WebSocket RPC with a connect handshake,
//! method dispatch, and sequence-numbered event broadcast.

mod auth;
mod broadcast;
mod events;
mod methods;
mod server;
mod state;
mod ws;

pub use {
    broadcast::broadcast,
    events::{BridgeBroadcast, ChatBroadcast},
    server::GatewayServer,
    state::{Broadcaster, GatewayState},
};
