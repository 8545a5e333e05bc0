//! Relay configuration: schema with defaults, plus JSON file loading

mod schema;
mod store;

pub use schema::{RelayConfig, DEFAULT_BUFFER_SIZE, DEFAULT_CLIENT_PORT};
pub use store::load_config;
