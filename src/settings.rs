//! Layered settings loading for the binary.
//!
//! The proxy core consumes a programmatically built [`ProxyConfig`]; this
//! loader hydrates one from optional config files and prefixed environment
//! variables so the binary can run without code changes.

use crate::proxy::ProxyConfig;
use config::{Config, Environment, File};
use serde::Deserialize;

// Re-export the loader's error so callers don't depend on the config crate
pub use config::ConfigError as SettingsError;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub proxy: ProxyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Settings {
    /// Load settings: defaults, then `config/default` and `config/local`
    /// files if present, then `MIMIC_PROXY__`-prefixed environment
    /// variables.
    pub fn new() -> Result<Self, SettingsError> {
        let config = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080_i64)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("MIMIC_PROXY").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}
