//! The external collaborators the core consumes but never owns (§1):
//! a `Config` view and an `AuthLookup` function for MQTT credentials.
//! Loading, persistence, and UI around these are out of scope here.

use serde::Deserialize;
use std::collections::HashMap;

/// Per-driver settings read from whatever configuration store the host
/// application uses. The core only ever reads this; it never writes it.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DriverSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_detect: bool,
    /// Explicit connection strings to open in addition to auto-detection.
    #[serde(default)]
    pub ids: Vec<String>,
    /// Free-form driver-specific settings (poll intervals, ports, etc.)
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

/// The read-only configuration view the core is handed at startup.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub readers: HashMap<String, DriverSettings>,
    /// Scan-channel buffer capacity (§5: "typical capacity 10").
    #[serde(default = "default_scan_buffer")]
    pub scan_buffer: usize,
}

fn default_scan_buffer() -> usize {
    10
}

impl Config {
    pub fn driver(&self, driver_id: &str) -> DriverSettings {
        self.readers.get(driver_id).cloned().unwrap_or_default()
    }
}

/// Credentials an `AuthLookup` may return for a given connection path
/// (§4.11, §5 "Authentication credentials are fetched via a pure function").
#[derive(Debug, Clone)]
pub struct MqttAuth {
    pub username: String,
    pub password: String,
}

/// A pure function: given the driver's connection path/URL, returns
/// optional credentials. No mutable shared state backs this; the host
/// application is free to implement it with an env lookup, a keyring, or
/// a config file read, none of which the core cares about.
pub type AuthLookup = std::sync::Arc<dyn Fn(&str) -> Option<MqttAuth> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_driver_settings_are_enabled() {
        let cfg = Config::default();
        assert!(cfg.driver("mqtt").enabled);
        assert_eq!(cfg.scan_buffer, 10);
    }
}
