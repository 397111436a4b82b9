//! Configuration schema and loading for the tether gateway.

mod env_subst;
mod loader;
pub mod schema;

pub use {
    env_subst::substitute_env,
    loader::{config_dir, data_dir, discover_and_load, find_config_file, load_config},
    schema::TetherConfig,
};
