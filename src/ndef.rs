//! NDEF Type-2 codec (§4.2). Parses and builds NDEF messages as they sit on
//! NFC Type-2 tags (TLV framing, short/long length headers, text records),
//! plus a read-only structured decoder for the other well-known record
//! types a go-pn532-style driver needs (§4.2 "Structured records").
//!
//! The teacher's `ndef.rs` only ever produced/consumed a single short-form
//! text record with a 1-byte TLV length and no size checking; this module
//! keeps its byte-layout conventions (status byte, `en` language, `T` type
//! field, `0x03`/`0xFE` TLV framing) but generalizes them to the full
//! Type-2 envelope the spec requires.

use crate::error::NdefError;
use serde_json::json;

/// Type-2 tag payload ceiling (§3 invariants).
pub const MAX_PAYLOAD_LEN: usize = 65_535;

/// Text record search pattern: TNF well-known, type `T`, language `en`.
const TEXT_EN_PATTERN: [u8; 4] = [0x54, 0x02, 0x65, 0x6E];
const TLV_TAG_NDEF: u8 = 0x03;
const TLV_TERMINATOR: u8 = 0xFE;

/// Builds the 2- or 4-byte TLV length header for a payload of `len` bytes.
///
/// - `len <= 254` -> `[0x03, len]`
/// - `254 < len <= 65535` -> `[0x03, 0xFF, hi, lo]`
/// - `len > 65535` -> `NdefError::TooLarge`
pub fn build_header(len: usize) -> Result<Vec<u8>, NdefError> {
    if len > MAX_PAYLOAD_LEN {
        return Err(NdefError::TooLarge(len));
    }
    if len <= 254 {
        Ok(vec![TLV_TAG_NDEF, len as u8])
    } else {
        Ok(vec![
            TLV_TAG_NDEF,
            0xFF,
            ((len >> 8) & 0xFF) as u8,
            (len & 0xFF) as u8,
        ])
    }
}

/// Scans `buffer` for a short-form Text record with language `en` and
/// returns the text between the pattern and the first `0xFE` terminator.
///
/// Tolerates leading padding before the pattern and trailing bytes after
/// the terminator (matches how raw page dumps come back from PC/SC/libnfc
/// reads, which rarely align cleanly on record boundaries).
pub fn parse_text(buffer: &[u8]) -> Result<String, NdefError> {
    let start = find_subslice(buffer, &TEXT_EN_PATTERN)
        .ok_or(NdefError::Parse("text/en start pattern not found"))?;

    let text_start = start + TEXT_EN_PATTERN.len();
    if text_start > buffer.len() {
        return Err(NdefError::Parse("start pattern too close to end of buffer"));
    }

    let terminator_offset = buffer[text_start..]
        .iter()
        .position(|&b| b == TLV_TERMINATOR)
        .ok_or(NdefError::Parse("no terminator after start pattern"))?;

    let text_bytes = &buffer[text_start..text_start + terminator_offset];
    String::from_utf8(text_bytes.to_vec())
        .map_err(|_| NdefError::Parse("text payload is not valid UTF-8"))
}

/// Builds a TLV-wrapped, terminated NDEF message containing a single short
/// or long Text record in language `en`, per §4.2.
///
/// Short-record form (payload <= 255 bytes) uses a 1-byte payload length;
/// above that, the long-record form (4-byte payload length) is used, up to
/// the Type-2 envelope ceiling.
pub fn build_message(text: &str) -> Result<Vec<u8>, NdefError> {
    let record = build_text_record(text)?;
    let mut out = build_header(record.len())?;
    out.extend_from_slice(&record);
    out.push(TLV_TERMINATOR);
    Ok(out)
}

fn build_text_record(text: &str) -> Result<Vec<u8>, NdefError> {
    const LANG: &[u8] = b"en";
    let text_bytes = text.as_bytes();

    let mut payload = Vec::with_capacity(1 + LANG.len() + text_bytes.len());
    payload.push(LANG.len() as u8); // status byte: UTF-8 (bit7=0) | lang length
    payload.extend_from_slice(LANG);
    payload.extend_from_slice(text_bytes);

    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(NdefError::TooLarge(payload.len()));
    }

    let short = payload.len() <= 255;
    // MB=1 ME=1 CF=0 IL=0, TNF=001 (well-known); SR bit set for short form.
    let header_byte: u8 = if short { 0xD1 } else { 0xC1 };
    let type_field = b"T";

    let mut record = Vec::with_capacity(3 + type_field.len() + payload.len());
    record.push(header_byte);
    record.push(type_field.len() as u8);
    if short {
        record.push(payload.len() as u8);
    } else {
        record.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    }
    record.extend_from_slice(type_field);
    record.extend_from_slice(&payload);
    Ok(record)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// A single raw NDEF record as extracted from the TLV-wrapped message,
/// before type-specific decoding.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub tnf: u8,
    pub record_type: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Splits the TLV value (the bytes between the `0x03 <len>` header and the
/// `0xFE` terminator) into its constituent NDEF records.
pub fn split_tlv_records(buffer: &[u8]) -> Result<Vec<RawRecord>, NdefError> {
    let tlv_start = buffer
        .iter()
        .position(|&b| b == TLV_TAG_NDEF)
        .ok_or(NdefError::Parse("no NDEF TLV found"))?;

    if tlv_start + 1 >= buffer.len() {
        return Err(NdefError::Parse("TLV length byte missing"));
    }

    let (len, value_start) = if buffer[tlv_start + 1] == 0xFF {
        if tlv_start + 4 > buffer.len() {
            return Err(NdefError::Parse("truncated 3-byte TLV length"));
        }
        let len = ((buffer[tlv_start + 2] as usize) << 8) | (buffer[tlv_start + 3] as usize);
        (len, tlv_start + 4)
    } else {
        (buffer[tlv_start + 1] as usize, tlv_start + 2)
    };

    if value_start + len > buffer.len() {
        return Err(NdefError::Parse("TLV value runs past end of buffer"));
    }
    let message = &buffer[value_start..value_start + len];

    if message.is_empty() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    let mut offset = 0;
    loop {
        if offset >= message.len() {
            break;
        }
        let header = message[offset];
        let me = header & 0x40 != 0;
        let sr = header & 0x10 != 0;
        let il = header & 0x08 != 0;
        let tnf = header & 0x07;

        let mut pos = offset + 1;
        if pos >= message.len() {
            return Err(NdefError::Parse("truncated record header"));
        }
        let type_len = message[pos] as usize;
        pos += 1;

        let payload_len = if sr {
            let v = *message
                .get(pos)
                .ok_or(NdefError::Parse("truncated short-record length"))? as usize;
            pos += 1;
            v
        } else {
            let bytes = message
                .get(pos..pos + 4)
                .ok_or(NdefError::Parse("truncated long-record length"))?;
            pos += 4;
            u32::from_be_bytes(bytes.try_into().unwrap()) as usize
        };

        let id_len = if il {
            let v = *message
                .get(pos)
                .ok_or(NdefError::Parse("truncated id length"))? as usize;
            pos += 1;
            v
        } else {
            0
        };

        let type_field = message
            .get(pos..pos + type_len)
            .ok_or(NdefError::Parse("truncated type field"))?
            .to_vec();
        pos += type_len;

        pos += id_len; // ID field is skipped; the core doesn't use it.

        let payload = message
            .get(pos..pos + payload_len)
            .ok_or(NdefError::Parse("truncated payload"))?
            .to_vec();
        pos += payload_len;

        records.push(RawRecord {
            tnf,
            record_type: type_field,
            payload,
        });

        offset = pos;
        if me {
            break;
        }
    }

    Ok(records)
}

/// The decoded form of a record's payload, per §4.2's structured-record
/// rules. Only the first record in a message is ever decoded this way.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedPayload {
    Text(String),
    Uri(String),
    Wifi(serde_json::Value),
    VCard(serde_json::Value),
    SmartPoster(serde_json::Value),
    Unknown(serde_json::Value),
}

impl DecodedPayload {
    /// The string that becomes `Token::text`: plain for Text/URI, a JSON
    /// string for every structured variant (§3: "JSON-serialized structured
    /// payload").
    pub fn into_text(self) -> String {
        match self {
            DecodedPayload::Text(s) => s,
            DecodedPayload::Uri(s) => s,
            DecodedPayload::Wifi(v) | DecodedPayload::VCard(v) | DecodedPayload::SmartPoster(v)
            | DecodedPayload::Unknown(v) => v.to_string(),
        }
    }
}

/// NFC Forum "well known" URI identifier-code abbreviation table (the
/// subset actually seen on consumer tags; code 0x00 means "no abbreviation").
fn uri_prefix(code: u8) -> &'static str {
    match code {
        0x01 => "http://www.",
        0x02 => "https://www.",
        0x03 => "http://",
        0x04 => "https://",
        0x05 => "tel:",
        0x06 => "mailto:",
        _ => "",
    }
}

/// Decodes the first record of a TLV-wrapped NDEF message into its
/// structured form (§4.2).
pub fn decode_first_record(buffer: &[u8]) -> Result<DecodedPayload, NdefError> {
    let records = split_tlv_records(buffer)?;
    let first = records
        .first()
        .ok_or(NdefError::Parse("message contains no records"))?;

    if first.payload.is_empty() {
        return Ok(DecodedPayload::Text(String::new()));
    }

    match first.record_type.as_slice() {
        b"T" => {
            let status = first.payload[0];
            let lang_len = (status & 0x3F) as usize;
            let text_start = 1 + lang_len;
            let text = first
                .payload
                .get(text_start..)
                .ok_or(NdefError::Parse("text record shorter than language field"))?;
            Ok(DecodedPayload::Text(
                String::from_utf8_lossy(text).into_owned(),
            ))
        }
        b"U" => {
            let code = first.payload[0];
            let rest = String::from_utf8_lossy(&first.payload[1..]);
            Ok(DecodedPayload::Uri(format!("{}{}", uri_prefix(code), rest)))
        }
        b"Sp" => Ok(DecodedPayload::SmartPoster(json!({
            "type": "smartposter",
            "raw": hex::encode(&first.payload),
        }))),
        t if is_wifi_type(t) => Ok(DecodedPayload::Wifi(decode_wifi(&first.payload))),
        t if is_vcard_type(t) => Ok(DecodedPayload::VCard(decode_vcard(&first.payload))),
        t => Ok(DecodedPayload::Unknown(json!({
            "type": "unknown",
            "typeField": String::from_utf8_lossy(t),
            "payload": hex::encode(&first.payload),
        }))),
    }
}

fn is_wifi_type(t: &[u8]) -> bool {
    t == b"application/vnd.wfa.wsc" || t.eq_ignore_ascii_case(b"wifi")
}

fn is_vcard_type(t: &[u8]) -> bool {
    t == b"text/vcard" || t == b"text/x-vcard"
}

/// Minimal Wi-Fi Simple Config (WSC) TLV decoder: enough attributes to
/// populate the JSON shape §4.2 demands. Unknown/absent attributes are
/// simply omitted rather than erroring, since WSC payloads in the wild
/// carry many attributes this core has no use for.
fn decode_wifi(payload: &[u8]) -> serde_json::Value {
    let mut ssid = None;
    let mut network_key = None;
    let mut auth_type = None;
    let mut encryption_type = None;
    let mut mac_address = None;

    let mut pos = 0;
    while pos + 4 <= payload.len() {
        let attr_id = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
        let len = u16::from_be_bytes([payload[pos + 2], payload[pos + 3]]) as usize;
        let value_start = pos + 4;
        let value_end = value_start + len;
        if value_end > payload.len() {
            break;
        }
        let value = &payload[value_start..value_end];
        match attr_id {
            0x45 => ssid = Some(String::from_utf8_lossy(value).into_owned()),
            0x27 => network_key = Some(String::from_utf8_lossy(value).into_owned()),
            0x03 if len == 2 => auth_type = Some(u16::from_be_bytes([value[0], value[1]])),
            0x0F if len == 2 => encryption_type = Some(u16::from_be_bytes([value[0], value[1]])),
            0x20 => mac_address = Some(hex::encode(value)),
            _ => {}
        }
        pos = value_end;
    }

    let mut obj = serde_json::Map::new();
    obj.insert("type".into(), json!("wifi"));
    if let Some(v) = ssid {
        obj.insert("ssid".into(), json!(v));
    }
    if let Some(v) = network_key {
        obj.insert("networkKey".into(), json!(v));
    }
    if let Some(v) = auth_type {
        obj.insert("authType".into(), json!(v));
    }
    if let Some(v) = encryption_type {
        obj.insert("encryptionType".into(), json!(v));
    }
    if let Some(v) = mac_address {
        obj.insert("macAddress".into(), json!(v));
    }
    serde_json::Value::Object(obj)
}

/// Minimal vCard 2.1/3.0 line decoder covering the fields §4.2 names.
fn decode_vcard(payload: &[u8]) -> serde_json::Value {
    let text = String::from_utf8_lossy(payload);
    let mut name = None;
    let mut phones = Vec::new();
    let mut emails = Vec::new();
    let mut organization = None;
    let mut title = None;
    let mut url = None;

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key_main = key.split(';').next().unwrap_or(key).to_uppercase();
        match key_main.as_str() {
            "FN" => name = Some(value.to_string()),
            "TEL" => phones.push(value.to_string()),
            "EMAIL" => emails.push(value.to_string()),
            "ORG" => organization = Some(value.to_string()),
            "TITLE" => title = Some(value.to_string()),
            "URL" => url = Some(value.to_string()),
            _ => {}
        }
    }

    let mut contact = serde_json::Map::new();
    if let Some(v) = name {
        contact.insert("name".into(), json!(v));
    }
    if !phones.is_empty() {
        contact.insert("phones".into(), json!(phones));
    }
    if !emails.is_empty() {
        contact.insert("emails".into(), json!(emails));
    }
    if let Some(v) = organization {
        contact.insert("organization".into(), json!(v));
    }
    if let Some(v) = title {
        contact.insert("title".into(), json!(v));
    }
    if let Some(v) = url {
        contact.insert("url".into(), json!(v));
    }

    json!({ "type": "vcard", "contact": serde_json::Value::Object(contact) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_edge_cases() {
        assert_eq!(build_header(0).unwrap(), vec![0x03, 0x00]);
        assert_eq!(build_header(254).unwrap(), vec![0x03, 0xFE]);
        assert_eq!(build_header(255).unwrap(), vec![0x03, 0xFF, 0x00, 0xFF]);
        assert_eq!(build_header(256).unwrap(), vec![0x03, 0xFF, 0x01, 0x00]);
        assert_eq!(build_header(65535).unwrap(), vec![0x03, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(
            build_header(65536),
            Err(NdefError::TooLarge(65536))
        ));
    }

    #[test]
    fn header_length_matches_spec() {
        assert_eq!(build_header(254).unwrap().len(), 2);
        assert_eq!(build_header(255).unwrap().len(), 4);
    }

    #[test]
    fn parse_hello() {
        let buf = [0x00, 0x54, 0x02, 0x65, 0x6E, 0x48, 0x65, 0x6C, 0x6C, 0x6F, 0xFE];
        assert_eq!(parse_text(&buf).unwrap(), "Hello");
    }

    #[test]
    fn parse_missing_terminator_fails() {
        let buf = [0x54, 0x02, 0x65, 0x6E, 0x48, 0x65, 0x6C, 0x6C, 0x6F];
        assert!(parse_text(&buf).is_err());
    }

    #[test]
    fn parse_missing_pattern_fails() {
        let buf = [0x01, 0x02, 0x03];
        assert!(parse_text(&buf).is_err());
    }

    #[test]
    fn parse_empty_payload_is_valid() {
        let buf = [0x54, 0x02, 0x65, 0x6E, 0xFE];
        assert_eq!(parse_text(&buf).unwrap(), "");
    }

    #[test]
    fn build_then_parse_round_trips() {
        let msg = build_message("hello world").unwrap();
        assert_eq!(parse_text(&msg).unwrap(), "hello world");
    }

    #[test]
    fn build_then_decode_first_record_round_trips() {
        let msg = build_message("hi").unwrap();
        let decoded = decode_first_record(&msg).unwrap();
        assert_eq!(decoded, DecodedPayload::Text("hi".to_string()));
    }

    #[test]
    fn long_record_used_above_255_bytes() {
        let text = "x".repeat(300);
        let msg = build_message(&text).unwrap();
        assert_eq!(parse_text(&msg).unwrap(), text);
    }

    #[test]
    fn too_large_payload_is_rejected() {
        let text = "x".repeat(70_000);
        assert!(matches!(build_message(&text), Err(NdefError::TooLarge(_))));
    }

    #[test]
    fn decode_unknown_record_type() {
        // TLV wrapping a single record with type "X" and payload "abc".
        let mut record = vec![0xD1, 1, 3];
        record.extend_from_slice(b"X");
        record.extend_from_slice(b"abc");
        let mut msg = build_header(record.len()).unwrap();
        msg.extend_from_slice(&record);
        msg.push(0xFE);

        match decode_first_record(&msg).unwrap() {
            DecodedPayload::Unknown(v) => {
                assert_eq!(v["type"], "unknown");
                assert_eq!(v["typeField"], "X");
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }
}
