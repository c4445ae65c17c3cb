//! PN532 command/response framing for the native UART/I2C/SPI driver (§4.7).
//!
//! No crate on the registry exposes go-pn532's polling-session abstraction,
//! so this models the wire-level command/error shapes directly, the way
//! hinata-rs's `pn532.rs` lays out its command table and error enum, and
//! layers the session/callback abstraction (`PollingSession`) on top in
//! `drivers::pn532`.

use num_derive::{FromPrimitive, ToPrimitive};
use thiserror::Error;

pub const PREAMBLE: u8 = 0x00;
pub const START_CODE: [u8; 2] = [0x00, 0xFF];
pub const HOST_TO_PN532: u8 = 0xD4;
pub const PN532_TO_HOST: u8 = 0xD5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Pn532Command {
    Diagnose = 0x00,
    GetFirmwareVersion = 0x02,
    SamConfiguration = 0x14,
    RfConfiguration = 0x32,
    InListPassiveTarget = 0x4A,
    InDataExchange = 0x40,
    InRelease = 0x52,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Pn532Error {
    #[error("response frame checksum invalid")]
    BadChecksum,
    #[error("response frame too short")]
    Truncated,
    #[error("unexpected response command byte: {0:#04x}")]
    UnexpectedCommand(u8),
    #[error("transport timed out waiting for a response")]
    Timeout,
    #[error("transport I/O error: {0}")]
    Transport(String),
    #[error("no target found")]
    NoTarget,
}

/// Wraps `payload` (command byte + args) in the standard PN532 information
/// frame: preamble, start code, length + length checksum, TFI, data,
/// data checksum, postamble.
pub fn build_frame(payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() + 1) as u8; // +1 for TFI
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.push(PREAMBLE);
    frame.extend_from_slice(&START_CODE);
    frame.push(len);
    frame.push((!len).wrapping_add(1));
    frame.push(HOST_TO_PN532);

    let mut checksum = HOST_TO_PN532;
    frame.extend_from_slice(payload);
    for &b in payload {
        checksum = checksum.wrapping_add(b);
    }
    frame.push((!checksum).wrapping_add(1));
    frame.push(0x00);
    frame
}

/// Extracts the data payload from a PN532 response frame, verifying framing
/// and checksums.
pub fn parse_frame(buf: &[u8]) -> Result<Vec<u8>, Pn532Error> {
    if buf.len() < 7 {
        return Err(Pn532Error::Truncated);
    }
    if buf[0] != PREAMBLE || buf[1..3] != START_CODE {
        return Err(Pn532Error::Truncated);
    }
    let len = buf[3] as usize;
    let len_checksum = buf[4];
    if buf[3].wrapping_add(len_checksum) != 0 {
        return Err(Pn532Error::BadChecksum);
    }
    let data_start = 5;
    let data_end = data_start + len;
    if buf.len() < data_end + 1 {
        return Err(Pn532Error::Truncated);
    }
    let tfi = buf[data_start];
    if tfi != PN532_TO_HOST {
        return Err(Pn532Error::UnexpectedCommand(tfi));
    }
    let data = &buf[data_start + 1..data_end];
    let mut checksum = tfi;
    for &b in data {
        checksum = checksum.wrapping_add(b);
    }
    if checksum.wrapping_add(buf[data_end]) != 0 {
        return Err(Pn532Error::BadChecksum);
    }
    Ok(data.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let payload = [Pn532Command::GetFirmwareVersion as u8];
        let frame = build_frame(&payload);
        assert_eq!(&frame[0..3], &[0x00, 0x00, 0xFF]);
    }

    #[test]
    fn parse_rejects_short_buffer() {
        assert_eq!(parse_frame(&[0x00, 0x00]), Err(Pn532Error::Truncated));
    }
}
