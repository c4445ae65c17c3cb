//! The driver contract every reader implementation satisfies (§4.1).

use crate::capability::Capability;
use crate::error::{DriverOpenError, WriteError};
use crate::token::{Scan, Token};
use crossbeam_channel::Sender;
use std::collections::HashSet;

/// Static facts about a driver, independent of any particular device
/// instance (§4.1 `metadata()`).
#[derive(Debug, Clone, Copy)]
pub struct DriverMetadata {
    pub id: &'static str,
    pub description: &'static str,
    pub default_enabled: bool,
    pub default_auto_detect: bool,
}

/// The polymorphic reader interface every driver implements (§4.1, §9).
///
/// `open` must validate the prefix, acquire resources, start background
/// polling, and return promptly; it never blocks waiting on hardware
/// events. `close` is the sole shutdown signal (§5): it must block until
/// the background worker has observed the stop request, after which no
/// further `Scan`s may be emitted.
pub trait Driver: Send {
    fn metadata(&self) -> DriverMetadata;

    /// Accepted driver-prefix strings, in priority order. Legacy aliases
    /// are listed alongside the canonical name (§4.1, §9).
    fn ids(&self) -> &'static [&'static str];

    fn open(&mut self, device: &str, scan_sink: Sender<Scan>) -> Result<(), DriverOpenError>;

    fn close(&mut self);

    /// Best-effort auto-discovery; `None` if nothing new was found.
    fn detect(&self, currently_connected: &[String]) -> Option<String>;

    fn device(&self) -> String;

    fn connected(&self) -> bool;

    fn info(&self) -> String;

    fn write(&mut self, text: &str) -> Result<Token, WriteError>;

    fn cancel_write(&mut self);

    fn capabilities(&self) -> HashSet<Capability>;

    /// Default no-op; drivers that echo media state back to the device
    /// (e.g. a display-capable reader) override this.
    fn on_media_change(&mut self, _media: &str) -> Result<(), WriteError> {
        Ok(())
    }

    fn reader_id(&self) -> String;
}

/// `driver(":" path)?` connection-string grammar (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub driver: String,
    pub path: String,
}

impl ConnectionString {
    pub fn parse(s: &str) -> Self {
        match s.split_once(':') {
            Some((driver, path)) => ConnectionString {
                driver: driver.to_string(),
                path: path.to_string(),
            },
            None => ConnectionString {
                driver: s.to_string(),
                path: String::new(),
            },
        }
    }

    pub fn connection_string(&self) -> String {
        if self.path.is_empty() {
            self.driver.clone()
        } else {
            format!("{}:{}", self.driver, self.path)
        }
    }
}

/// Strips underscores and lowercases, so `simple_serial` and `simpleserial`
/// normalize to the same driver id (§4.1).
pub fn normalize_prefix(id: &str) -> String {
    id.to_lowercase().replace('_', "")
}

/// True iff `prefix` (already split from a connection string) matches one
/// of `accepted_ids` after normalization.
pub fn prefix_matches(prefix: &str, accepted_ids: &[&str]) -> bool {
    let norm = normalize_prefix(prefix);
    accepted_ids.iter().any(|id| normalize_prefix(id) == norm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_driver_and_path() {
        let cs = ConnectionString::parse("file:/tmp/scan.txt");
        assert_eq!(cs.driver, "file");
        assert_eq!(cs.path, "/tmp/scan.txt");
        assert_eq!(cs.connection_string(), "file:/tmp/scan.txt");
    }

    #[test]
    fn parses_driver_without_path() {
        let cs = ConnectionString::parse("pcsc");
        assert_eq!(cs.driver, "pcsc");
        assert_eq!(cs.path, "");
    }

    #[test]
    fn underscore_normalized_prefixes_match() {
        assert!(prefix_matches("simple_serial", &["simpleserial"]));
        assert!(prefix_matches("simpleserial", &["simple_serial"]));
        assert!(!prefix_matches("other", &["simpleserial"]));
    }

    #[test]
    fn mqtt_path_with_slashes_is_preserved() {
        let cs = ConnectionString::parse("mqtt://user@host:1883/zaparoo/scans");
        assert_eq!(cs.driver, "mqtt");
        assert_eq!(cs.path, "//user@host:1883/zaparoo/scans");
    }
}
