//! Reader subsystem core: driver discovery and identity, per-device
//! lifecycle, concurrent scan production, NDEF codec, one-at-a-time tag
//! writing, and the reader-error/normal-removal disambiguation downstream
//! dispatch relies on.
//!
//! This crate produces `Scan` values onto a channel; it does not launch
//! media, evaluate playlists, persist configuration, or serve HTTP/WS.

pub mod blocklist;
pub mod capability;
pub mod config;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod fanin;
pub mod ndef;
pub mod pn532_proto;
pub mod reader_id;
pub mod token;

pub use capability::Capability;
pub use config::{AuthLookup, Config, MqttAuth};
pub use driver::{ConnectionString, Driver, DriverMetadata};
pub use error::{DriverOpenError, NdefError, ReaderError, SelectWriterError, WriteError};
pub use token::{Scan, Token, TokenType};
