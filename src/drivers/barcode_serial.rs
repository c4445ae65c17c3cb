//! RS-232 barcode/QR scanner driver (§4.8, C9): line-oriented, STX/ETX
//! framing, no active-token concept (so no `reader_error` path at all).

use crate::capability::Capability;
use crate::driver::{prefix_matches, ConnectionString, Driver, DriverMetadata};
use crate::error::{DriverOpenError, WriteError};
use crate::reader_id;
use crate::token::{Scan, Token, TokenType};
use crossbeam_channel::Sender;
use log::warn;
use serialport::SerialPort;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const BUFFER_CAP: usize = 8 * 1024;

pub struct BarcodeSerialDriver {
    device: String,
    rid: String,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl BarcodeSerialDriver {
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

impl Default for BarcodeSerialDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for BarcodeSerialDriver {
    fn metadata(&self) -> DriverMetadata {
        DriverMetadata {
            id: "barcode",
            description: "RS-232 line-oriented barcode/QR scanner",
            default_enabled: false,
            default_auto_detect: false,
        }
    }

    fn ids(&self) -> &'static [&'static str] {
        &["barcode", "barcodeserial"]
    }

    fn open(&mut self, device: &str, scan_sink: Sender<Scan>) -> Result<(), DriverOpenError> {
        let cs = ConnectionString::parse(device);
        if !prefix_matches(&cs.driver, self.ids()) {
            return Err(DriverOpenError::InvalidDriver(cs.driver));
        }
        if cs.path.is_empty() {
            return Err(DriverOpenError::PathInvalid(
                "barcode driver requires a serial device path".into(),
            ));
        }

        self.device = device.to_string();
        self.rid = reader_id::reader_id("barcode", &cs.path);

        let port = serialport::new(&cs.path, 9600)
            .timeout(Duration::from_millis(250))
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
        format!("barcode serial {}", self.device)
    }

    fn write(&mut self, _text: &str) -> Result<Token, WriteError> {
        Err(WriteError::Io("barcode scanners are read-only".into()))
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
    let mut buf = Vec::with_capacity(BUFFER_CAP);
    let mut chunk = [0u8; 256];

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match port.read(&mut chunk) {
            Ok(0) => continue,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > BUFFER_CAP {
                    warn!("barcode: line buffer overflowed, dropping and resyncing");
                    buf.clear();
                    continue;
                }
                drain_lines(&mut buf, &source, &scan_sink);
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(_) => {
                connected.store(false, Ordering::SeqCst);
                break;
            }
        }
    }
}

/// Splits complete lines out of `buf` (leaving any partial trailing line in
/// place), collapsing `\r`, `\n`, `\r\n` terminators (§4.8).
fn drain_lines(buf: &mut Vec<u8>, source: &str, scan_sink: &Sender<Scan>) {
    loop {
        let Some(pos) = buf.iter().position(|&b| b == b'\r' || b == b'\n') else {
            break;
        };
        let line = buf[..pos].to_vec();
        let mut consumed = pos + 1;
        if buf.get(pos) == Some(&b'\r') && buf.get(pos + 1) == Some(&b'\n') {
            consumed += 1;
        }
        buf.drain(..consumed);

        if let Ok(text) = String::from_utf8(line) {
            if let Some(token) = parse_line(&text, source) {
                let _ = scan_sink.send(Scan::detected(source.to_string(), token));
            }
        }
    }
}

/// Trims whitespace, strips one leading STX / trailing ETX, and returns a
/// `Barcode` token unless the result is empty (§4.8 `parse_line`).
fn parse_line(line: &str, source: &str) -> Option<Token> {
    let mut s = line.trim().trim_matches('\r');
    if let Some(rest) = s.strip_prefix('\u{02}') {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix('\u{03}') {
        s = rest;
    }
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    Some(Token::new(s, s, TokenType::Barcode, s, source))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_line() {
        let tok = parse_line("ABC123", "barcode:/dev/ttyUSB0").unwrap();
        assert_eq!(tok.uid, "ABC123");
        assert_eq!(tok.text, "ABC123");
        assert_eq!(tok.token_type, TokenType::Barcode);
    }

    #[test]
    fn strips_stx_etx() {
        let tok = parse_line("\u{02}ABC123\u{03}", "barcode:x").unwrap();
        assert_eq!(tok.text, "ABC123");
    }

    #[test]
    fn empty_line_yields_no_token() {
        assert!(parse_line("   ", "barcode:x").is_none());
    }

    #[test]
    fn drain_lines_collapses_crlf() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut buf = b"AAA\r\nBBB\r".to_vec();
        drain_lines(&mut buf, "barcode:x", &tx);
        let first = rx.recv().unwrap();
        assert_eq!(first.token.unwrap().text, "AAA");
        let second = rx.recv().unwrap();
        assert_eq!(second.token.unwrap().text, "BBB");
        assert!(buf.is_empty());
    }
}
