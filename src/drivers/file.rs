//! File-watched payload driver (§4.10, C11): polls a text file every
//! 100ms; empty content is removal, content diffs are new scans, ten
//! consecutive read failures stop the worker with the usual reader-error
//! discipline.

use crate::capability::Capability;
use crate::driver::{prefix_matches, ConnectionString, Driver, DriverMetadata};
use crate::error::{DriverOpenError, WriteError};
use crate::fanin::PresenceTracker;
use crate::reader_id;
use crate::token::{Scan, Token, TokenType};
use crossbeam_channel::Sender;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

pub struct FileDriver {
    device: String,
    rid: String,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl FileDriver {
    pub fn new() -> Self {
        Self {
            device: String::new(),
            rid: String::new(),
            stop: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl Default for FileDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for FileDriver {
    fn metadata(&self) -> DriverMetadata {
        DriverMetadata {
            id: "file",
            description: "Polls a text file for scan payloads",
            default_enabled: false,
            default_auto_detect: false,
        }
    }

    fn ids(&self) -> &'static [&'static str] {
        &["file"]
    }

    fn open(&mut self, device: &str, scan_sink: Sender<Scan>) -> Result<(), DriverOpenError> {
        let cs = ConnectionString::parse(device);
        if !prefix_matches(&cs.driver, self.ids()) {
            return Err(DriverOpenError::InvalidDriver(cs.driver));
        }
        let path = PathBuf::from(&cs.path);
        if !path.is_absolute() {
            return Err(DriverOpenError::PathInvalid(
                "file driver requires an absolute path".into(),
            ));
        }

        self.device = device.to_string();
        self.rid = reader_id::reader_id("file", &cs.path);

        if !path.exists() {
            std::fs::write(&path, "").map_err(|e| {
                DriverOpenError::HardwareOpen(format!("failed to create {}: {e}", path.display()))
            })?;
        }

        self.stop.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);

        let stop = self.stop.clone();
        let connected = self.connected.clone();
        let source = self.device.clone();

        self.worker = Some(std::thread::spawn(move || {
            run_worker(path, source, scan_sink, stop, connected);
        }));

        Ok(())
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn detect(&self, _currently_connected: &[String]) -> Option<String> {
        None
    }

    fn device(&self) -> String {
        self.device.clone()
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn info(&self) -> String {
        format!("file {}", self.device)
    }

    fn write(&mut self, _text: &str) -> Result<Token, WriteError> {
        Err(WriteError::Io("file driver is read-only".into()))
    }

    fn cancel_write(&mut self) {}

    fn capabilities(&self) -> std::collections::HashSet<Capability> {
        std::collections::HashSet::new()
    }

    fn reader_id(&self) -> String {
        self.rid.clone()
    }
}

fn run_worker(
    path: PathBuf,
    source: String,
    scan_sink: Sender<Scan>,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
) {
    let mut presence = PresenceTracker::new();
    let mut last_contents: Option<String> = None;
    let mut consecutive_failures = 0u32;

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                consecutive_failures = 0;
                let trimmed = contents.trim().to_string();

                if trimmed.is_empty() {
                    if last_contents.take().is_some() {
                        if let Some(scan) = presence.on_removed(source.clone()) {
                            let _ = scan_sink.send(scan);
                        }
                    }
                } else if last_contents.as_deref() != Some(trimmed.as_str()) {
                    last_contents = Some(trimmed.clone());
                    let token = Token::new(
                        "",
                        trimmed.clone(),
                        TokenType::File,
                        hex::encode(contents.as_bytes()),
                        source.clone(),
                    );
                    let scan = presence.on_detected(source.clone(), token);
                    let _ = scan_sink.send(scan);
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    connected.store(false, Ordering::SeqCst);
                    if let Some(scan) = presence.on_fatal(source.clone()) {
                        let _ = scan_sink.send(scan);
                    }
                    break;
                }
                let _ = scan_sink.send(Scan::soft_error(source.clone(), e.to_string()));
            }
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_relative_path() {
        let mut d = FileDriver::new();
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let err = d.open("file:relative/path.txt", tx).unwrap_err();
        assert!(matches!(err, DriverOpenError::PathInvalid(_)));
    }
}
