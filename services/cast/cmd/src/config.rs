//! Configuration handling for the castlink binary.
//!
//! Reads the shared YAML config file and environment variables,
//! providing defaults for everything so the binary runs with no
//! configuration at all.

use anyhow::Result;
use cast_session::{ProtocolProfile, SessionConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Castlink configuration
#[derive(Debug, Clone)]
pub struct CastlinkConfig {
    /// Sender package name reported in CONNECT
    pub sender_package: String,
    /// Transport connect timeout (seconds)
    pub connect_timeout: u64,
    /// Heartbeat timeout (seconds)
    pub heartbeat_timeout: u64,
    /// Tracked-request timeout (seconds)
    pub request_timeout: u64,
    /// Discovery probe deadline (seconds)
    pub probe_timeout: u64,
}

impl Default for CastlinkConfig {
    fn default() -> Self {
        Self {
            sender_package: "castlink".to_string(),
            connect_timeout: 10,
            heartbeat_timeout: 10,
            request_timeout: 10,
            probe_timeout: 10,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    cast: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    config: Option<HashMap<String, String>>,
}

impl CastlinkConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            if let Ok(root_config) = serde_yaml::from_str::<RootConfig>(&content) {
                config.apply_root_config(root_config);
                info!("Loaded configuration from {:?}", config_path.as_ref());
            } else {
                warn!(
                    "Failed to parse config file {:?}, using defaults",
                    config_path.as_ref()
                );
            }
        }

        config.apply_environment_overrides();

        info!(
            "Final castlink configuration: sender_package={}, heartbeat_timeout={}s, request_timeout={}s",
            config.sender_package, config.heartbeat_timeout, config.request_timeout
        );

        Ok(config)
    }

    /// Build the session configuration from these settings
    pub fn session_config(&self) -> SessionConfig {
        let mut profile = ProtocolProfile::default();
        profile.sender_info.package = self.sender_package.clone();
        SessionConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout),
            request_timeout: Duration::from_secs(self.request_timeout),
            profile,
        }
    }

    fn apply_root_config(&mut self, root_config: RootConfig) {
        let Some(service) = root_config.services.and_then(|s| s.cast) else {
            return;
        };
        let Some(config_map) = service.config else {
            return;
        };

        for (key, value) in config_map {
            match key.as_str() {
                "services.cast.sender_package" => {
                    self.sender_package = value;
                }
                "services.cast.connect_timeout" => {
                    if let Ok(seconds) = value.parse::<u64>() {
                        self.connect_timeout = seconds;
                    }
                }
                "services.cast.heartbeat_timeout" => {
                    if let Ok(seconds) = value.parse::<u64>() {
                        self.heartbeat_timeout = seconds;
                    }
                }
                "services.cast.request_timeout" => {
                    if let Ok(seconds) = value.parse::<u64>() {
                        self.request_timeout = seconds;
                    }
                }
                "services.cast.probe_timeout" => {
                    if let Ok(seconds) = value.parse::<u64>() {
                        self.probe_timeout = seconds;
                    }
                }
                _ => {
                    // Ignore unknown configuration keys
                }
            }
        }
    }

    fn apply_environment_overrides(&mut self) {
        if let Ok(package) = std::env::var("CASTLINK_SENDER_PACKAGE") {
            self.sender_package = package;
            info!(
                "Sender package overridden by environment: {}",
                self.sender_package
            );
        }

        if let Ok(heartbeat) = std::env::var("CASTLINK_HEARTBEAT_TIMEOUT") {
            if let Ok(seconds) = heartbeat.parse::<u64>() {
                self.heartbeat_timeout = seconds;
                info!("Heartbeat timeout overridden by environment: {}s", seconds);
            }
        }

        if let Ok(request) = std::env::var("CASTLINK_REQUEST_TIMEOUT") {
            if let Ok(seconds) = request.parse::<u64>() {
                self.request_timeout = seconds;
                info!("Request timeout overridden by environment: {}s", seconds);
            }
        }
    }
}
