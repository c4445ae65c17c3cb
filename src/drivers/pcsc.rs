//! PC/SC driver (§4.5, C6). Polls a single named PC/SC reader; reads UID +
//! NDEF; emits scans with the reader-error discipline from `crate::fanin`.
//!
//! Grounded in the teacher's `nfc_service.rs`/`apdu.rs`/`cards.rs`, which
//! already drive the `pcsc` crate's `Context`/`ReaderState`/`Card` types the
//! same way; this version narrows scope to one configured reader per
//! driver instance (matching §5 "each driver owns its device handle
//! exclusively") and replaces the teacher's outer auto-restart loop with
//! the spec's terminate-on-fault state machine.

use crate::capability::Capability;
use crate::driver::{prefix_matches, ConnectionString, Driver, DriverMetadata};
use crate::error::{DriverOpenError, WriteError};
use crate::fanin::PresenceTracker;
use crate::ndef;
use crate::reader_id;
use crate::token::{Scan, Token, TokenType};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, warn};
use pcsc::{Card, Context, Protocols, ReaderState, Scope, ShareMode, State};
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const POLL_TIMEOUT: Duration = Duration::from_millis(250);
const NTAG_MAX_PAGE: u8 = 220;
const APDU_GET_UID: [u8; 5] = [0xFF, 0xCA, 0x00, 0x00, 0x00];

enum WorkerCommand {
    Write(String, Sender<Result<Token, WriteError>>),
    CancelWrite,
}

pub struct PcscDriver {
    device: String,
    reader_name: String,
    rid: String,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    write_in_progress: Arc<AtomicBool>,
    cmd_tx: Option<Sender<WorkerCommand>>,
    worker: Option<JoinHandle<()>>,
}

impl PcscDriver {
    pub fn new() -> Self {
        Self {
            device: String::new(),
            reader_name: String::new(),
            rid: String::new(),
            stop: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
            write_in_progress: Arc::new(AtomicBool::new(false)),
            cmd_tx: None,
            worker: None,
        }
    }
}

impl Default for PcscDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for PcscDriver {
    fn metadata(&self) -> DriverMetadata {
        DriverMetadata {
            id: "pcsc",
            description: "PC/SC smart card readers (contactless NFC Type-2 tags)",
            default_enabled: true,
            default_auto_detect: true,
        }
    }

    fn ids(&self) -> &'static [&'static str] {
        &["pcsc"]
    }

    fn open(
        &mut self,
        device: &str,
        scan_sink: Sender<Scan>,
    ) -> Result<(), DriverOpenError> {
        let cs = ConnectionString::parse(device);
        if !prefix_matches(&cs.driver, self.ids()) {
            return Err(DriverOpenError::InvalidDriver(cs.driver));
        }
        if cs.path.is_empty() {
            return Err(DriverOpenError::PathInvalid(
                "pcsc driver requires a reader name".into(),
            ));
        }

        self.device = device.to_string();
        self.reader_name = cs.path.clone();
        self.rid = reader_id::reader_id("pcsc", &cs.path);

        let (cmd_tx, cmd_rx) = bounded::<WorkerCommand>(4);
        self.cmd_tx = Some(cmd_tx);
        self.stop.store(false, Ordering::SeqCst);

        let stop = self.stop.clone();
        let connected = self.connected.clone();
        let reader_name = self.reader_name.clone();
        let source = self.device.clone();

        self.worker = Some(std::thread::spawn(move || {
            run_worker(reader_name, source, scan_sink, cmd_rx, stop, connected);
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
        let ctx = Context::establish(Scope::User).ok()?;
        let mut buf = [0u8; 2048];
        let names: Vec<String> = ctx
            .list_readers(&mut buf)
            .ok()?
            .filter_map(|n| n.to_str().ok().map(str::to_string))
            .collect();
        names
            .into_iter()
            .map(|n| format!("pcsc:{n}"))
            .find(|cs| !currently_connected.contains(cs))
    }

    fn device(&self) -> String {
        self.device.clone()
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn info(&self) -> String {
        format!("pcsc reader {}", self.reader_name)
    }

    fn write(&mut self, text: &str) -> Result<Token, WriteError> {
        let tx = self
            .cmd_tx
            .as_ref()
            .ok_or(WriteError::Io("driver not open".into()))?;
        if self.write_in_progress.swap(true, Ordering::SeqCst) {
            return Err(WriteError::WriteInProgress);
        }

        let (reply_tx, reply_rx) = bounded(1);
        let result = match tx.send(WorkerCommand::Write(text.to_string(), reply_tx)) {
            Err(_) => Err(WriteError::Io("worker not running".into())),
            Ok(()) => reply_rx
                .recv_timeout(Duration::from_secs(10))
                .unwrap_or(Err(WriteError::TransportTimeout)),
        };
        self.write_in_progress.store(false, Ordering::SeqCst);
        result
    }

    fn cancel_write(&mut self) {
        if let Some(tx) = &self.cmd_tx {
            let _ = tx.send(WorkerCommand::CancelWrite);
        }
    }

    fn capabilities(&self) -> std::collections::HashSet<Capability> {
        [Capability::Write].into_iter().collect()
    }

    fn reader_id(&self) -> String {
        self.rid.clone()
    }
}

fn run_worker(
    reader_name: String,
    source: String,
    scan_sink: Sender<Scan>,
    cmd_rx: Receiver<WorkerCommand>,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
) {
    let ctx = match Context::establish(Scope::User) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("pcsc: failed to establish context: {e}");
            return;
        }
    };

    let mut presence = PresenceTracker::new();
    let reader_cstring = match CString::new(reader_name.as_bytes()) {
        Ok(c) => c,
        Err(_) => {
            error!("pcsc: reader name contains interior NUL");
            return;
        }
    };

    'outer: loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        // --- ListingReaders ---
        let mut buf = [0u8; 2048];
        let names = match ctx.list_readers(&mut buf) {
            Ok(iter) => iter.map(CString::from).collect::<Vec<_>>(),
            Err(_) => {
                connected.store(false, Ordering::SeqCst);
                if let Some(scan) = presence.on_fatal(source.clone()) {
                    let _ = scan_sink.send(scan);
                }
                break 'outer;
            }
        };
        if !names.iter().any(|n| n == &reader_cstring) {
            connected.store(false, Ordering::SeqCst);
            if let Some(scan) = presence.on_fatal(source.clone()) {
                let _ = scan_sink.send(scan);
            }
            break 'outer;
        }
        connected.store(true, Ordering::SeqCst);

        // --- WaitingForCard ---
        let mut states = vec![ReaderState::new(reader_cstring.clone(), State::UNAWARE)];
        match ctx.get_status_change(POLL_TIMEOUT, &mut states) {
            Ok(()) => {}
            Err(pcsc::Error::Timeout) => {
                process_commands(&cmd_rx);
                continue 'outer;
            }
            Err(e) => {
                warn!("pcsc: get_status_change error: {e}");
                process_commands(&cmd_rx);
                continue 'outer;
            }
        }

        process_commands(&cmd_rx);

        if stop.load(Ordering::SeqCst) {
            break;
        }

        if !states[0].event_state().intersects(State::PRESENT) {
            if let Some(scan) = presence.on_removed(source.clone()) {
                let _ = scan_sink.send(scan);
            }
            continue 'outer;
        }

        // --- ReadingCard ---
        match read_card(&ctx, &reader_cstring, &source) {
            Ok(token) => {
                let scan = presence.on_detected(source.clone(), token);
                let _ = scan_sink.send(scan);
            }
            Err(e) => {
                warn!("pcsc: read failed: {e}");
                continue 'outer;
            }
        }

        // --- WaitingForRemoval ---
        loop {
            if stop.load(Ordering::SeqCst) {
                break 'outer;
            }
            let mut wait_states =
                vec![ReaderState::new(reader_cstring.clone(), State::PRESENT)];
            match ctx.get_status_change(POLL_TIMEOUT, &mut wait_states) {
                Ok(()) => {}
                Err(pcsc::Error::Timeout) => {
                    process_commands(&cmd_rx);
                    continue;
                }
                Err(_) => {
                    if let Some(scan) = presence.on_fatal(source.clone()) {
                        let _ = scan_sink.send(scan);
                    }
                    break 'outer;
                }
            }
            process_commands(&cmd_rx);
            if !wait_states[0].event_state().intersects(State::PRESENT) {
                if let Some(scan) = presence.on_removed(source.clone()) {
                    let _ = scan_sink.send(scan);
                }
                break;
            }
        }
    }
}

fn process_commands(cmd_rx: &Receiver<WorkerCommand>) {
    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            WorkerCommand::Write(_, reply) => {
                let _ = reply.send(Err(WriteError::TagNotFound));
            }
            WorkerCommand::CancelWrite => {}
        }
    }
}

fn read_card(ctx: &Context, reader: &CString, source: &str) -> Result<Token, String> {
    let card = ctx
        .connect(reader, ShareMode::Shared, Protocols::ANY)
        .map_err(|e| format!("connect failed: {e}"))?;

    let uid = transmit(&card, &APDU_GET_UID)?;

    let mut data = Vec::new();
    for page in 0..NTAG_MAX_PAGE {
        let apdu = [0xFF, 0xB0, 0x00, page, 0x04];
        match transmit(&card, &apdu) {
            Ok(block) if block.len() == 4 && block.iter().all(|&b| b == 0) => break,
            Ok(block) if block.len() == 4 => data.extend_from_slice(&block),
            _ => break,
        }
    }

    let text = ndef::parse_text(&data).unwrap_or_default();

    Ok(Token::new(
        hex::encode(&uid),
        text,
        TokenType::Unknown,
        hex::encode(&data),
        source,
    ))
}

/// Sends an APDU and returns the response body with a verified `90 00`
/// status word stripped off (§6 "NFC PC/SC APDUs used").
fn transmit(card: &Card, apdu: &[u8]) -> Result<Vec<u8>, String> {
    let mut recv = [0u8; 264];
    let resp = card
        .transmit(apdu, &mut recv)
        .map_err(|e| format!("transmit error: {e}"))?;
    if resp.len() < 2 || resp[resp.len() - 2] != 0x90 || resp[resp.len() - 1] != 0x00 {
        return Err(format!("bad status word: {resp:02X?}"));
    }
    Ok(resp[..resp.len() - 2].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_wrong_prefix() {
        let mut d = PcscDriver::new();
        let (tx, _rx) = bounded(1);
        let err = d.open("libnfc:whatever", tx).unwrap_err();
        assert!(matches!(err, DriverOpenError::InvalidDriver(_)));
    }

    #[test]
    fn open_rejects_empty_path() {
        let mut d = PcscDriver::new();
        let (tx, _rx) = bounded(1);
        let err = d.open("pcsc:", tx).unwrap_err();
        assert!(matches!(err, DriverOpenError::PathInvalid(_)));
    }
}
