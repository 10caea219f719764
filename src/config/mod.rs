//! Configuration management
//!
//! JSON configuration with serde, validation, and environment overrides.

pub mod loader;
pub mod types;

pub use loader::{
    create_default_config, load_config, load_config_str, load_config_with_env, ENV_LOG_LEVEL,
};
pub use types::{ClientConfig, Config, LogConfig, RouteConfig, ServerConfig, UdpConfig};
