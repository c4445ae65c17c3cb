//! Thin demo binary: wires up the driver registry from a `Config`, opens
//! every enabled/auto-detected reader, and logs scans as they arrive.
//! The actual subsystem lives in the library crate (`src/lib.rs`); nothing
//! here is part of the public surface.

use crossbeam_channel::bounded;
use readerhub::{drivers::registry, Config};

fn main() {
    env_logger::init();

    let config = Config::default();
    let (scan_tx, scan_rx) = bounded(config.scan_buffer);

    let mut drivers = registry::build_all(None);
    for driver in drivers.iter_mut() {
        let settings = config.driver(driver.metadata().id);
        if !settings.enabled {
            continue;
        }
        for id in &settings.ids {
            if let Err(e) = driver.open(id, scan_tx.clone()) {
                log::warn!("failed to open {id}: {e}");
            }
        }
    }

    log::info!("readerhub demo running; waiting for scans (Ctrl+C to exit)");
    for scan in scan_rx.iter() {
        if let Some(token) = &scan.token {
            log::info!("scan from {}: {:?} {:?}", scan.source, token.token_type, token.text);
        } else if scan.reader_error {
            log::warn!("reader error from {}", scan.source);
        } else if let Some(err) = &scan.error {
            log::warn!("soft error from {}: {err}", scan.source);
        } else {
            log::info!("removal from {}", scan.source);
        }
    }
}
