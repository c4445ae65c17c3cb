//! UDP "Groovy GMC" proxy (§4.12, C13): beacons to a local core, receives
//! command datagrams, and either injects a `zapscript:` token locally or
//! forwards the payload to the last-seen proxy peer.

use crate::capability::Capability;
use crate::driver::{prefix_matches, ConnectionString, Driver, DriverMetadata};
use crate::error::{DriverOpenError, WriteError};
use crate::reader_id;
use crate::token::{Scan, Token, TokenType};
use crossbeam_channel::Sender;
use log::warn;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const CORE_ADDR: &str = "127.0.0.1:32105";
const ZAPSCRIPT_PREFIX: &[u8] = b"zapscript:";
const DEFAULT_BEACON_INTERVAL: Duration = Duration::from_secs(1);

pub struct UdpProxyDriver {
    device: String,
    rid: String,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl UdpProxyDriver {
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

impl Default for UdpProxyDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for UdpProxyDriver {
    fn metadata(&self) -> DriverMetadata {
        DriverMetadata {
            id: "udpgmc",
            description: "UDP Groovy GMC beacon/forward proxy",
            default_enabled: false,
            default_auto_detect: false,
        }
    }

    fn ids(&self) -> &'static [&'static str] {
        &["udpgmc", "udp"]
    }

    fn open(&mut self, device: &str, scan_sink: Sender<Scan>) -> Result<(), DriverOpenError> {
        let cs = ConnectionString::parse(device);
        if !prefix_matches(&cs.driver, self.ids()) {
            return Err(DriverOpenError::InvalidDriver(cs.driver));
        }
        let proxy_port: u16 = cs
            .path
            .parse()
            .map_err(|_| DriverOpenError::PathInvalid("expected a UDP port number".into()))?;

        self.device = device.to_string();
        self.rid = reader_id::reader_id("udpgmc", &cs.path);

        let core_conn = UdpSocket::bind("127.0.0.1:0")
            .map_err(|e| DriverOpenError::HardwareOpen(format!("core socket bind failed: {e}")))?;
        core_conn
            .set_read_timeout(Some(Duration::from_millis(250)))
            .map_err(|e| DriverOpenError::TimeoutSetting(e.to_string()))?;

        let proxy_conn = UdpSocket::bind(("0.0.0.0", proxy_port))
            .map_err(|e| DriverOpenError::HardwareOpen(format!("proxy socket bind failed: {e}")))?;
        proxy_conn
            .set_read_timeout(Some(Duration::from_millis(250)))
            .map_err(|e| DriverOpenError::TimeoutSetting(e.to_string()))?;

        self.stop.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);

        let stop = self.stop.clone();
        let connected = self.connected.clone();
        let source = self.device.clone();

        self.worker = Some(std::thread::spawn(move || {
            run_worker(core_conn, proxy_conn, source, scan_sink, stop, connected);
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
        format!("udp gmc proxy {}", self.device)
    }

    fn write(&mut self, _text: &str) -> Result<Token, WriteError> {
        Err(WriteError::Io("udp proxy has no write path".into()))
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
    core_conn: UdpSocket,
    proxy_conn: UdpSocket,
    source: String,
    scan_sink: Sender<Scan>,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
) {
    let proxy_target: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
    let core_addr: SocketAddr = CORE_ADDR.parse().expect("static address parses");

    let mut last_beacon = std::time::Instant::now();
    let mut core_buf = [0u8; 2048];
    let mut proxy_buf = [0u8; 2048];

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        if last_beacon.elapsed() >= DEFAULT_BEACON_INTERVAL {
            let _ = core_conn.send_to(&[0x00], core_addr);
            last_beacon = std::time::Instant::now();
        }

        if let Ok((n, _)) = core_conn.recv_from(&mut core_buf) {
            handle_command(&core_buf[..n], &source, &scan_sink, &proxy_conn, &proxy_target);
        }

        match proxy_conn.recv_from(&mut proxy_buf) {
            Ok((_, peer)) => {
                *proxy_target.lock().unwrap() = Some(peer);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => {}
        }
    }

    connected.store(false, Ordering::SeqCst);
}

/// Handles one command datagram from the core (§4.12): `zapscript:`-prefixed
/// payloads are injected as tokens; anything else is forwarded to the last
/// known proxy peer, or dropped if none is known yet.
///
/// Guards against short datagrams (< prefix length) rather than reading
/// past the buffer end (§9 "Open questions").
fn handle_command(
    payload: &[u8],
    source: &str,
    scan_sink: &Sender<Scan>,
    proxy_conn: &UdpSocket,
    proxy_target: &Arc<Mutex<Option<SocketAddr>>>,
) {
    if payload.len() >= ZAPSCRIPT_PREFIX.len() && &payload[..ZAPSCRIPT_PREFIX.len()] == ZAPSCRIPT_PREFIX {
        let text = String::from_utf8_lossy(&payload[ZAPSCRIPT_PREFIX.len()..]).into_owned();
        use unicode_normalization::UnicodeNormalization;
        let normalized: String = text.nfc().collect();
        let token = Token::new("", normalized, TokenType::Unknown, "", source);
        let _ = scan_sink.send(Scan::detected(source.to_string(), token));
        return;
    }

    let target = *proxy_target.lock().unwrap();
    match target {
        Some(addr) => {
            let _ = proxy_conn.send_to(payload, addr);
        }
        None => warn!("udpgmc: no proxy peer known yet, dropping {} byte datagram", payload.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_datagram_does_not_panic() {
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let core = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = Arc::new(Mutex::new(None));
        // 3 bytes, shorter than "zapscript:" (10 bytes) -- must not index out of bounds.
        handle_command(b"abc", "udpgmc:9999", &tx, &core, &target);
    }

    #[test]
    fn zapscript_prefix_becomes_scan() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let core = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = Arc::new(Mutex::new(None));
        handle_command(b"zapscript:**launch.system:nes", "udpgmc:9999", &tx, &core, &target);
        let scan = rx.recv().unwrap();
        assert_eq!(scan.token.unwrap().text, "**launch.system:nes");
    }
}
