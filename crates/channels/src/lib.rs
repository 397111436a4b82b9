//! Channel plugins and their per-account runtime lifecycle.

pub mod manager;
pub mod plugin;
pub mod registry;

pub use {
    manager::{AccountSnapshot, ChannelManager, ManagerError},
    plugin::{ChannelPlugin, ChannelStop},
    registry::ChannelRegistry,
};
