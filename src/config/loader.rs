//! Configuration loading
//!
//! JSON files, parsed with serde and validated before use. Environment
//! variables override a small set of fields so deployments can tweak logging
//! without editing the file.

use std::path::Path;

use tracing::{debug, info};

use crate::error::ConfigError;

use super::types::{ClientConfig, Config, RouteConfig, ServerConfig, UdpConfig};

/// Environment variable overriding the configured log level.
pub const ENV_LOG_LEVEL: &str = "WS_ROUTER_LOG_LEVEL";

/// Load and validate a configuration file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }
    let contents = std::fs::read_to_string(path)?;
    let config = load_config_str(&contents)?;
    info!(
        path = %path.display(),
        servers = config.servers.len(),
        clients = config.clients.len(),
        udp = config.udp.len(),
        "configuration loaded"
    );
    Ok(config)
}

/// Parse and validate a configuration from a JSON string.
pub fn load_config_str(contents: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Load a configuration file and apply environment overrides.
pub fn load_config_with_env<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    match std::env::var(ENV_LOG_LEVEL) {
        Ok(level) => {
            debug!(level = %level, "log level overridden from environment");
            config.log.level = level;
            Ok(())
        }
        Err(std::env::VarError::NotPresent) => Ok(()),
        Err(e) => Err(ConfigError::EnvError {
            name: ENV_LOG_LEVEL.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// A starter configuration with one of everything, for `-g`.
#[must_use]
pub fn create_default_config() -> Config {
    Config {
        servers: vec![ServerConfig {
            listen: "0.0.0.0:8080".to_string(),
            routes: vec![RouteConfig {
                path: "/".to_string(),
                target: "127.0.0.1:22".to_string(),
            }],
        }],
        clients: vec![ClientConfig {
            listen: "127.0.0.1:1080".to_string(),
            remote: "ws://relay.example.com:8080/".to_string(),
            proxy: None,
        }],
        udp: vec![UdpConfig {
            listen: "127.0.0.1:5353".to_string(),
            target: "1.1.1.1:53".to_string(),
            reserved: vec![],
            idle_timeout_secs: 300,
        }],
        log: Default::default(),
    }
}
