mod loader;
mod raw;
pub mod error;

pub use error::ConfigError;
pub use loader::{load_config, AbmConfig, ApnsConfig, ScepConfig, ServerConfig};
