//! MQTT driver (§4.11, C12): subscribes to a broker/topic; each non-empty
//! payload becomes a scan. Grounded in macpit-spoolbuddy's
//! `mqtt/client.rs` reconnect-loop-over-rumqttc pattern.

use crate::capability::Capability;
use crate::config::AuthLookup;
use crate::driver::{prefix_matches, ConnectionString, Driver, DriverMetadata};
use crate::error::{DriverOpenError, WriteError};
use crate::reader_id;
use crate::token::{Scan, Token, TokenType};
use crossbeam_channel::Sender;
use log::warn;
use rumqttc::{Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MqttDriver {
    device: String,
    rid: String,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    auth_lookup: Option<AuthLookup>,
}

impl MqttDriver {
    pub fn new(auth_lookup: Option<AuthLookup>) -> Self {
        Self {
            device: String::new(),
            rid: String::new(),
            stop: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
            worker: None,
            auth_lookup,
        }
    }
}

struct MqttTarget {
    tls: bool,
    host: String,
    port: u16,
    topic: String,
}

/// Parses `path = [mqtt://|mqtts://]host:port/topic[...]` (§4.11).
fn parse_target(path: &str) -> Option<MqttTarget> {
    let (tls, rest) = if let Some(r) = path.strip_prefix("mqtts://") {
        (true, r)
    } else if let Some(r) = path.strip_prefix("mqtt://") {
        (false, r)
    } else {
        (false, path.trim_start_matches("//"))
    };

    let (host_port, topic) = rest.split_once('/')?;
    let (host, port_str) = host_port.split_once(':')?;
    let port: u16 = port_str.parse().ok()?;
    if host.is_empty() || topic.is_empty() {
        return None;
    }
    Some(MqttTarget {
        tls,
        host: host.to_string(),
        port,
        topic: topic.to_string(),
    })
}

impl Driver for MqttDriver {
    fn metadata(&self) -> DriverMetadata {
        DriverMetadata {
            id: "mqtt",
            description: "Subscribes to an MQTT topic; each payload is a scan",
            default_enabled: false,
            default_auto_detect: false,
        }
    }

    fn ids(&self) -> &'static [&'static str] {
        &["mqtt"]
    }

    fn open(&mut self, device: &str, scan_sink: Sender<Scan>) -> Result<(), DriverOpenError> {
        let cs = ConnectionString::parse(device);
        if !prefix_matches(&cs.driver, self.ids()) {
            return Err(DriverOpenError::InvalidDriver(cs.driver));
        }
        let target = parse_target(&cs.path).ok_or_else(|| {
            DriverOpenError::PathInvalid("expected host:port/topic".into())
        })?;

        self.device = device.to_string();
        self.rid = reader_id::reader_id("mqtt", &cs.path);

        let auth = self
            .auth_lookup
            .as_ref()
            .and_then(|lookup| lookup(&cs.path));

        let mut opts = MqttOptions::new(format!("readerhub-{}", self.rid), &target.host, target.port);
        opts.set_keep_alive(Duration::from_secs(30));
        if let Some(auth) = &auth {
            opts.set_credentials(auth.username.clone(), auth.password.clone());
        }
        if target.tls {
            opts.set_transport(Transport::Tls(TlsConfiguration::default()));
        }

        let (client, connection) = rumqttc::Client::new(opts, 16);

        self.stop.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);

        let stop = self.stop.clone();
        let connected = self.connected.clone();
        let source = self.device.clone();
        let topic = target.topic.clone();

        // The single thread that owns `connection` drives the handshake
        // (subscribe once ConnAck arrives) and every subsequent publish
        // notification; §4.11's 5s connect bound is enforced by the
        // `ready_rx` handoff below before `open` returns.
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<bool>(1);
        self.worker = Some(std::thread::spawn(move || {
            run_worker(client, connection, topic, source, scan_sink, ready_tx, stop, connected);
        }));

        match ready_rx.recv_timeout(CONNECT_TIMEOUT) {
            Ok(true) => {}
            _ => {
                self.stop.store(true, Ordering::SeqCst);
                if let Some(handle) = self.worker.take() {
                    let _ = handle.join();
                }
                return Err(DriverOpenError::HardwareOpen(format!(
                    "mqtt connect to {}:{} timed out",
                    target.host, target.port
                )));
            }
        }

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
        format!("mqtt {}", self.device)
    }

    fn write(&mut self, _text: &str) -> Result<Token, WriteError> {
        Err(WriteError::Io("mqtt driver is read-only".into()))
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
    client: rumqttc::Client,
    mut connection: rumqttc::Connection,
    topic: String,
    source: String,
    scan_sink: Sender<Scan>,
    ready_tx: crossbeam_channel::Sender<bool>,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
) {
    let mut ready_sent = false;

    for notification in connection.iter() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if client.subscribe(&topic, QoS::AtLeastOnce).is_err() {
                    let _ = scan_sink.send(Scan::soft_error(source.clone(), "subscribe failed"));
                }
                if !ready_sent {
                    ready_sent = true;
                    let _ = ready_tx.send(true);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if let Some(scan) = payload_to_scan(&source, &publish.payload) {
                    let _ = scan_sink.send(scan);
                }
            }
            Ok(_) => {}
            Err(e) => {
                if !ready_sent {
                    ready_sent = true;
                    let _ = ready_tx.send(false);
                }
                warn!("mqtt: connection lost: {e}");
                // rumqttc's `Connection::iter()` reconnects internally on
                // the next poll; nothing to do here besides logging.
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
}

/// Converts one received MQTT payload into a scan, per §4.11: empty
/// payloads are ignored, everything else becomes a `mqtt`-typed token.
fn payload_to_scan(source: &str, payload: &[u8]) -> Option<Scan> {
    if payload.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(payload).into_owned();
    let token = Token::new("", text, TokenType::Mqtt, hex::encode(payload), source);
    Some(Scan::detected(source.to_string(), token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_target() {
        let t = parse_target("broker.local:1883/zaparoo/scans").unwrap();
        assert!(!t.tls);
        assert_eq!(t.host, "broker.local");
        assert_eq!(t.port, 1883);
        assert_eq!(t.topic, "zaparoo/scans");
    }

    #[test]
    fn parses_tls_scheme() {
        let t = parse_target("mqtts://broker.local:8883/scans").unwrap();
        assert!(t.tls);
    }

    #[test]
    fn empty_payload_ignored() {
        assert!(payload_to_scan("mqtt:x", b"").is_none());
    }

    #[test]
    fn non_empty_payload_becomes_scan() {
        let scan = payload_to_scan("mqtt:x", b"hello").unwrap();
        assert_eq!(scan.token.unwrap().text, "hello");
    }
}
