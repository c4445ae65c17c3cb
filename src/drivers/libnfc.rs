//! libnfc driver (§4.6, C7): PN532/ACR122 via libnfc, using the `nfc1`
//! binding crate (the real libnfc FFI wrapper retrieved alongside this
//! repo's teacher). Polling, NDEF read, write-with-verification, the
//! retryable-error taxonomy, and the ACR122-only / legacy-transport modes
//! all live here.

use crate::capability::Capability;
use crate::driver::{prefix_matches, ConnectionString, Driver, DriverMetadata};
use crate::error::{DriverOpenError, LibnfcError, WriteError};
use crate::fanin::PresenceTracker;
use crate::ndef;
use crate::reader_id;
use crate::token::{Scan, Token, TokenType};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, warn};
use nfc1::{Context as NfcContext, Device as NfcDevice, Modulation, ModulationType};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const POLL_PERIOD: Duration = Duration::from_millis(250);
const TIME_TO_FORGET_CARD: Duration = Duration::from_millis(500);
const DEFAULT_WRITE_TIMEOUT_TRIES: u32 = 120;
const MAX_OPEN_TRIES: u32 = 10;
const WRITE_VERIFY_RETRIES: u32 = 3;

/// The three transport families §4.6 distinguishes. Kept as disjoint driver
/// instances with disjoint id lists (§9 "Open questions"), so detection
/// never collides between legacy and non-legacy UART modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibnfcMode {
    All,
    Acr122Only,
    LegacyUart,
    LegacyI2c,
}

impl LibnfcMode {
    fn ids(self) -> &'static [&'static str] {
        match self {
            LibnfcMode::All => &["libnfc"],
            LibnfcMode::Acr122Only => &["libnfcacr122", "acr122usb"],
            LibnfcMode::LegacyUart => &["legacypn532uart"],
            LibnfcMode::LegacyI2c => &["legacypn532i2c"],
        }
    }

    /// Translates the user-facing connection path into libnfc's connstring.
    fn to_libnfc_connstring(self, path: &str) -> String {
        match self {
            LibnfcMode::Acr122Only => format!("acr122_usb:{path}"),
            LibnfcMode::LegacyUart => format!("pn532_uart:{path}"),
            LibnfcMode::LegacyI2c => format!("pn532_i2c:{path}"),
            LibnfcMode::All => path.to_string(),
        }
    }
}

enum WorkerCommand {
    Write(String, Sender<Result<Token, WriteError>>),
    CancelWrite,
}

const NTAG_MAX_PAGE: u8 = 220;

pub struct LibnfcDriver {
    mode: LibnfcMode,
    device: String,
    rid: String,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    write_in_progress: Arc<AtomicBool>,
    write_cancel: Arc<AtomicBool>,
    cmd_tx: Option<Sender<WorkerCommand>>,
    worker: Option<JoinHandle<()>>,
}

impl LibnfcDriver {
    pub fn new(mode: LibnfcMode) -> Self {
        Self {
            mode,
            device: String::new(),
            rid: String::new(),
            stop: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
            write_in_progress: Arc::new(AtomicBool::new(false)),
            write_cancel: Arc::new(AtomicBool::new(false)),
            cmd_tx: None,
            worker: None,
        }
    }
}

impl Driver for LibnfcDriver {
    fn metadata(&self) -> DriverMetadata {
        match self.mode {
            LibnfcMode::All => DriverMetadata {
                id: "libnfc",
                description: "PN532 / ACR122 readers via libnfc",
                default_enabled: true,
                default_auto_detect: true,
            },
            LibnfcMode::Acr122Only => DriverMetadata {
                id: "libnfcacr122",
                description: "ACR122U USB reader via libnfc",
                default_enabled: false,
                default_auto_detect: true,
            },
            LibnfcMode::LegacyUart => DriverMetadata {
                id: "legacypn532uart",
                description: "Legacy PN532 over UART via libnfc",
                default_enabled: false,
                default_auto_detect: false,
            },
            LibnfcMode::LegacyI2c => DriverMetadata {
                id: "legacypn532i2c",
                description: "Legacy PN532 over I2C via libnfc",
                default_enabled: false,
                default_auto_detect: false,
            },
        }
    }

    fn ids(&self) -> &'static [&'static str] {
        self.mode.ids()
    }

    fn open(&mut self, device: &str, scan_sink: Sender<Scan>) -> Result<(), DriverOpenError> {
        let cs = ConnectionString::parse(device);
        if !prefix_matches(&cs.driver, self.ids()) {
            return Err(DriverOpenError::InvalidDriver(cs.driver));
        }
        if cs.path.is_empty() {
            return Err(DriverOpenError::PathInvalid(
                "libnfc driver requires a device path".into(),
            ));
        }

        self.device = device.to_string();
        self.rid = reader_id::reader_id(self.metadata().id, &cs.path);

        let connstring = self.mode.to_libnfc_connstring(&cs.path);
        let mut tries = 0u32;
        let mut ctx = NfcContext::new().map_err(|e| {
            DriverOpenError::HardwareOpen(format!("failed to create libnfc context: {e:?}"))
        })?;

        let mut device = loop {
            match NfcDevice::new_with_connstring(&mut ctx, &connstring) {
                Ok(mut dev) => {
                    if dev.initiator_init().is_ok() {
                        break dev;
                    }
                }
                Err(_) if tries < MAX_OPEN_TRIES => {}
                Err(e) => {
                    crate::blocklist::add(&cs.path);
                    return Err(DriverOpenError::HardwareOpen(format!(
                        "libnfc open failed after {tries} tries: {e:?}"
                    )));
                }
            }
            tries += 1;
            if tries >= MAX_OPEN_TRIES {
                crate::blocklist::add(&cs.path);
                return Err(DriverOpenError::HardwareOpen(
                    "libnfc open exhausted retries".into(),
                ));
            }
            let backoff_ms = (50u64 * (tries as u64) * (tries as u64)).min(1000);
            std::thread::sleep(Duration::from_millis(backoff_ms));
        };
        let _ = device.initiator_init();

        let (cmd_tx, cmd_rx) = bounded::<WorkerCommand>(4);
        self.cmd_tx = Some(cmd_tx);
        self.stop.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);

        let stop = self.stop.clone();
        let connected = self.connected.clone();
        let write_cancel = self.write_cancel.clone();
        let source = self.device.clone();

        self.worker = Some(std::thread::spawn(move || {
            run_worker(device, source, scan_sink, cmd_rx, stop, connected, write_cancel);
        }));

        Ok(())
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        self.cmd_tx = None;
        self.connected.store(false, Ordering::SeqCst);
    }

    fn detect(&self, currently_connected: &[String]) -> Option<String> {
        // I2C has no serial-port enumeration concept; legacy I2C devices
        // must be configured explicitly.
        if self.mode == LibnfcMode::LegacyI2c {
            return None;
        }
        let ports = serialport::available_ports().ok()?;
        let prefix = self.metadata().id;
        for p in ports {
            if crate::blocklist::is_blocked(&p.port_name) {
                continue;
            }
            let candidate = format!("{prefix}:{}", p.port_name);
            if !currently_connected.contains(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    fn device(&self) -> String {
        self.device.clone()
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn info(&self) -> String {
        format!("libnfc [{}] {}", self.metadata().id, self.device)
    }

    fn write(&mut self, text: &str) -> Result<Token, WriteError> {
        let tx = self
            .cmd_tx
            .as_ref()
            .ok_or(WriteError::Io("driver not open".into()))?;
        if self.write_in_progress.swap(true, Ordering::SeqCst) {
            return Err(WriteError::WriteInProgress);
        }
        self.write_cancel.store(false, Ordering::SeqCst);

        let (reply_tx, reply_rx) = bounded(1);
        let result = match tx.send(WorkerCommand::Write(text.to_string(), reply_tx)) {
            Err(_) => Err(WriteError::Io("worker not running".into())),
            Ok(()) => reply_rx
                .recv_timeout(Duration::from_secs(35))
                .unwrap_or(Err(WriteError::TransportTimeout)),
        };
        self.write_in_progress.store(false, Ordering::SeqCst);
        result
    }

    fn cancel_write(&mut self) {
        self.write_cancel.store(true, Ordering::SeqCst);
        if let Some(tx) = &self.cmd_tx {
            let _ = tx.send(WorkerCommand::CancelWrite);
        }
    }

    fn capabilities(&self) -> HashSet<Capability> {
        [Capability::Write].into_iter().collect()
    }

    fn reader_id(&self) -> String {
        self.rid.clone()
    }
}

fn modulations() -> Vec<Modulation> {
    vec![
        Modulation {
            modulation_type: ModulationType::Iso14443a,
            baud_rate: nfc1::BaudRate::Baud106,
        },
        Modulation {
            modulation_type: ModulationType::Felica,
            baud_rate: nfc1::BaudRate::Baud212,
        },
    ]
}

fn run_worker(
    mut device: NfcDevice,
    source: String,
    scan_sink: Sender<Scan>,
    cmd_rx: Receiver<WorkerCommand>,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    write_cancel: Arc<AtomicBool>,
) {
    let mut presence = PresenceTracker::new();
    let mut last_uid: Option<Vec<u8>> = None;
    let mut last_seen = Instant::now();
    let mods = modulations();

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        match process_commands(&cmd_rx, &mut device, &mut presence, &source, &scan_sink, &write_cancel) {
            true => continue,
            false => {}
        }

        match device.initiator_poll_target(&mods, 1, POLL_PERIOD) {
            Ok(target) => {
                let uid = target_uid(&target);
                last_seen = Instant::now();
                if last_uid.as_deref() != Some(uid.as_slice()) {
                    last_uid = Some(uid.clone());
                    match read_ndef(&mut device, &uid, &source) {
                        Ok(token) => {
                            let scan = presence.on_detected(source.clone(), token);
                            let _ = scan_sink.send(scan);
                        }
                        Err(e) => warn!("libnfc: ndef read failed: {e}"),
                    }
                }
            }
            Err(e) => {
                let classified = classify(&e);
                match classified {
                    LibnfcError::TagNotFound => {
                        // Treated the same as a poll timeout: if we haven't
                        // seen the card in `TIME_TO_FORGET_CARD`, consider
                        // it removed.
                        if last_uid.is_some() && last_seen.elapsed() >= TIME_TO_FORGET_CARD {
                            last_uid = None;
                            if let Some(scan) = presence.on_removed(source.clone()) {
                                let _ = scan_sink.send(scan);
                            }
                        }
                    }
                    LibnfcError::Io(ref msg) => {
                        error!("libnfc: fatal I/O error: {msg}");
                        connected.store(false, Ordering::SeqCst);
                        if let Some(scan) = presence.on_fatal(source.clone()) {
                            let _ = scan_sink.send(scan);
                        }
                        break;
                    }
                    LibnfcError::TransportTimeout | LibnfcError::DataCorrupted => {}
                }
            }
        }
    }
}

/// Drains the command queue. Returns `true` if the caller should skip this
/// poll iteration (a write was serviced, consuming the shared initiator).
fn process_commands(
    cmd_rx: &Receiver<WorkerCommand>,
    device: &mut NfcDevice,
    presence: &mut PresenceTracker,
    source: &str,
    scan_sink: &Sender<Scan>,
    write_cancel: &AtomicBool,
) -> bool {
    let mut serviced = false;
    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            WorkerCommand::Write(text, reply) => {
                serviced = true;
                let result = do_write(device, &text, presence, source, scan_sink, write_cancel);
                let _ = reply.send(result);
            }
            WorkerCommand::CancelWrite => {}
        }
    }
    serviced
}

fn target_uid(target: &nfc1::Target) -> Vec<u8> {
    target.nfc_target_info_as_bytes()
}

fn read_ndef(device: &mut NfcDevice, uid: &[u8], source: &str) -> Result<Token, String> {
    // Real hardware dispatches NTAG vs MIFARE by ATQA/SAK; this core
    // classifies by UID length the way NTAG (7-byte UID) vs. classic
    // MIFARE (4-byte UID) tags differ in practice.
    let token_type = if uid.len() == 7 {
        TokenType::Ntag
    } else {
        TokenType::Mifare
    };

    let mut data = Vec::new();
    for page in 0..NTAG_MAX_PAGE {
        match device.pn53x_transceive(&[0x30, page], 64, nfc1::Timeout::Default) {
            Ok(block) if block.len() >= 4 && block[..4].iter().all(|&b| b == 0) => break,
            Ok(block) if block.len() >= 4 => data.extend_from_slice(&block[..4]),
            _ => break,
        }
    }

    let text = ndef::parse_text(&data).unwrap_or_default();

    Ok(Token::new(
        hex::encode(uid),
        text,
        token_type,
        hex::encode(&data),
        source,
    ))
}

/// Writes `text`, then verifies by re-polling and comparing the decoded
/// text and UID against what was intended (§4.6, §8 scenario 6).
fn do_write(
    device: &mut NfcDevice,
    text: &str,
    presence: &mut PresenceTracker,
    source: &str,
    scan_sink: &Sender<Scan>,
    cancel: &AtomicBool,
) -> Result<Token, WriteError> {
    let message = ndef::build_message(text)?;

    let mut tries = 0;
    let target = loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(WriteError::Canceled);
        }
        match device.initiator_poll_target(&modulations(), 1, POLL_PERIOD) {
            Ok(t) => break t,
            Err(_) if tries < DEFAULT_WRITE_TIMEOUT_TRIES => {
                tries += 1;
                std::thread::sleep(Duration::from_millis(250));
            }
            Err(_) => return Err(WriteError::TagNotFound),
        }
    };
    let uid = target_uid(&target);

    let mut page = 4u8;
    for chunk in message.chunks(4) {
        if cancel.load(Ordering::SeqCst) {
            return Err(WriteError::Canceled);
        }
        let mut buf = [0u8; 4];
        buf[..chunk.len()].copy_from_slice(chunk);
        device
            .pn53x_transceive(&[&[0xA2, page], &buf[..]].concat(), 1, nfc1::Timeout::Default)
            .map_err(|_| WriteError::TransportTimeout)?;
        page += 1;
    }

    for _ in 0..WRITE_VERIFY_RETRIES {
        match read_ndef(device, &uid, source) {
            Ok(token) if token.text == text => {
                let scan = presence.on_detected(source.to_string(), token.clone());
                let _ = scan_sink.send(scan);
                return Ok(token);
            }
            Ok(_) => return Err(WriteError::DataCorrupted),
            Err(_) => std::thread::sleep(Duration::from_millis(100)),
        }
    }
    Err(WriteError::DataCorrupted)
}

/// Maps an `nfc1` error onto §7's retryable taxonomy. The `nfc1` crate's
/// error type implements `Debug`/`Display` over libnfc's `NFC_E*` codes;
/// matching on their textual form keeps this classification stable across
/// the handful of variants that matter to the reader-error discipline.
fn classify(e: &nfc1::Error) -> LibnfcError {
    let msg = format!("{e:?}").to_lowercase();
    if msg.contains("timeout") {
        LibnfcError::TransportTimeout
    } else if msg.contains("notarget") || msg.contains("no_target") {
        LibnfcError::TagNotFound
    } else if msg.contains("io") || msg.contains("device_not_found") {
        LibnfcError::Io(msg)
    } else {
        LibnfcError::TransportTimeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_have_disjoint_ids() {
        let all = LibnfcMode::All.ids();
        let acr = LibnfcMode::Acr122Only.ids();
        let legacy_uart = LibnfcMode::LegacyUart.ids();
        let legacy_i2c = LibnfcMode::LegacyI2c.ids();
        for a in [all, acr, legacy_uart, legacy_i2c] {
            for b in [all, acr, legacy_uart, legacy_i2c] {
                if a.as_ptr() == b.as_ptr() {
                    continue;
                }
                assert!(a.iter().all(|id| !b.contains(id)));
            }
        }
    }

    #[test]
    fn connstring_translation() {
        assert_eq!(
            LibnfcMode::Acr122Only.to_libnfc_connstring("001"),
            "acr122_usb:001"
        );
        assert_eq!(
            LibnfcMode::LegacyUart.to_libnfc_connstring("/dev/ttyUSB0"),
            "pn532_uart:/dev/ttyUSB0"
        );
    }

    #[test]
    fn open_rejects_wrong_prefix() {
        let mut d = LibnfcDriver::new(LibnfcMode::All);
        let (tx, _rx) = bounded(1);
        let err = d.open("pcsc:whatever", tx).unwrap_err();
        assert!(matches!(err, DriverOpenError::InvalidDriver(_)));
    }
}
