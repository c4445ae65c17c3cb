//! Simple serial line protocol driver (§4.9, C10): `SCAN\tkey=value…`
//! frames, dedup by `(uid, text)`, and a 1-second idle-removal timeout.

use crate::capability::Capability;
use crate::driver::{prefix_matches, ConnectionString, Driver, DriverMetadata};
use crate::error::{DriverOpenError, WriteError};
use crate::fanin::PresenceTracker;
use crate::reader_id;
use crate::token::{Scan, Token, TokenType};
use crossbeam_channel::Sender;
use serialport::SerialPort;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const IDLE_REMOVAL: Duration = Duration::from_secs(1);

pub struct SimpleSerialDriver {
    device: String,
    rid: String,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SimpleSerialDriver {
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

impl Default for SimpleSerialDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for SimpleSerialDriver {
    fn metadata(&self) -> DriverMetadata {
        DriverMetadata {
            id: "simpleserial",
            description: "Line-protocol serial reader (SCAN\\tkey=value...)",
            default_enabled: false,
            default_auto_detect: false,
        }
    }

    fn ids(&self) -> &'static [&'static str] {
        &["simpleserial", "simple_serial"]
    }

    fn open(&mut self, device: &str, scan_sink: Sender<Scan>) -> Result<(), DriverOpenError> {
        let cs = ConnectionString::parse(device);
        if !prefix_matches(&cs.driver, self.ids()) {
            return Err(DriverOpenError::InvalidDriver(cs.driver));
        }
        if cs.path.is_empty() {
            return Err(DriverOpenError::PathInvalid(
                "simpleserial driver requires a serial device path".into(),
            ));
        }

        self.device = device.to_string();
        self.rid = reader_id::reader_id("simpleserial", &cs.path);

        let port = serialport::new(&cs.path, 9600)
            .timeout(Duration::from_millis(200))
            .open()
            .map_err(|e| DriverOpenError::HardwareOpen(format!("serial open failed: {e}")))?;

        self.stop.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);

        let stop = self.stop.clone();
        let connected = self.connected.clone();
        let source = self.device.clone();

        self.worker = Some(std::thread::spawn(move || {
            run_worker(port, source, scan_sink, stop, connected);
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
        format!("simple serial {}", self.device)
    }

    fn write(&mut self, _text: &str) -> Result<Token, WriteError> {
        Err(WriteError::Io("simple serial readers are read-only".into()))
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
    mut port: Box<dyn SerialPort>,
    source: String,
    scan_sink: Sender<Scan>,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
) {
    let mut presence = PresenceTracker::new();
    let mut last_key: Option<(String, String)> = None;
    let mut last_seen = Instant::now();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        match port.read(&mut chunk) {
            Ok(0) => {}
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                last_seen = Instant::now();
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line).trim().to_string();
                    if let Some(token) = parse_scan_line(&line, &source) {
                        let key = (token.uid.clone(), token.text.clone());
                        if last_key.as_ref() != Some(&key) {
                            last_key = Some(key);
                            let scan = presence.on_detected(source.clone(), token);
                            let _ = scan_sink.send(scan);
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => {
                if let Some(scan) = presence.on_fatal(source.clone()) {
                    let _ = scan_sink.send(scan);
                }
                connected.store(false, Ordering::SeqCst);
                break;
            }
        }

        if last_key.is_some() && last_seen.elapsed() >= IDLE_REMOVAL {
            last_key = None;
            if let Some(scan) = presence.on_removed(source.clone()) {
                let _ = scan_sink.send(scan);
            }
        }
    }
}

/// Parses a `SCAN\tkey=value...` line into a `Token` (§4.9). Returns `None`
/// for any line not beginning with the `SCAN\t` marker.
fn parse_scan_line(line: &str, source: &str) -> Option<Token> {
    let rest = line.strip_prefix("SCAN\t")?;

    let mut uid = String::new();
    let mut text = String::new();
    let mut from_api = false;
    let mut recognized_any = false;

    for field in rest.split('\t') {
        if let Some((key, value)) = field.split_once('=') {
            recognized_any = true;
            match key {
                "uid" => uid = value.to_string(),
                "text" => text = value.to_string(),
                "removable" => from_api = value == "no",
                _ => {}
            }
        }
    }

    if !recognized_any {
        text = rest.to_string();
    }

    let mut token = Token::new(uid, text, TokenType::Unknown, "", source);
    token.from_api = from_api;
    Some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_scan_line() {
        let tok = parse_scan_line("SCAN\tuid=abc123\ttext=hello\tremovable=no", "simpleserial:x")
            .unwrap();
        assert_eq!(tok.uid, "abc123");
        assert_eq!(tok.text, "hello");
        assert!(tok.from_api);
    }

    #[test]
    fn unrecognized_fields_become_text() {
        let tok = parse_scan_line("SCAN\t**launch.system:nes", "simpleserial:x").unwrap();
        assert_eq!(tok.text, "**launch.system:nes");
        assert_eq!(tok.uid, "");
    }

    #[test]
    fn non_scan_line_is_ignored() {
        assert!(parse_scan_line("PING", "simpleserial:x").is_none());
    }
}
