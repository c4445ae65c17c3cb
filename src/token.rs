//! Canonical token and scan-envelope types (§3 Data Model).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

/// One of the recognized carrier/payload kinds a `Token` can represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenType {
    #[serde(rename = "NTAG")]
    Ntag,
    #[serde(rename = "MIFARE")]
    Mifare,
    FeliCa,
    Amiibo,
    LegoDimensions,
    Barcode,
    Unknown,
    #[serde(rename = "file")]
    File,
    #[serde(rename = "mqtt")]
    Mqtt,
    Playlist,
}

/// Immutable record of a single detected token. Once emitted, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// Device-reported tag identifier, lowercase hex when binary; empty for
    /// non-carrier tokens (barcode, file, mqtt).
    pub uid: String,
    /// Canonical payload string, normalized to Unicode NFC.
    pub text: String,
    pub token_type: TokenType,
    /// Lowercase hex of the raw bytes read, empty if none were read.
    pub data: String,
    pub scan_time: DateTime<Utc>,
    /// Connection string of the producing reader (routing key for on-removal).
    pub source: String,
    pub from_api: bool,
    pub unsafe_: bool,
}

impl Token {
    /// Builds a token, applying the mandatory NFC-normalization of `text`
    /// (§3: "Normalized to Unicode NFC").
    pub fn new(
        uid: impl Into<String>,
        text: impl AsRef<str>,
        token_type: TokenType,
        data: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            uid: uid.into(),
            text: text.as_ref().nfc().collect(),
            token_type,
            data: data.into(),
            scan_time: Utc::now(),
            source: source.into(),
            from_api: false,
            unsafe_: false,
        }
    }
}

/// The envelope emitted on the shared scan channel; exactly one is produced
/// per state change (§3).
#[derive(Debug, Clone)]
pub struct Scan {
    /// Connection string of the producing reader.
    pub source: String,
    /// `Some` means "currently present/changed"; `None` means "nothing present".
    pub token: Option<Token>,
    /// Soft error surfaced without claiming anything about presence.
    pub error: Option<String>,
    /// True iff `token` is `None` because the hardware became unusable while
    /// a token was active. This is the single invariant the whole subsystem
    /// exists to preserve correctly — see `crate::fanin`.
    pub reader_error: bool,
}

impl Scan {
    pub fn detected(source: impl Into<String>, token: Token) -> Self {
        Scan {
            source: source.into(),
            token: Some(token),
            error: None,
            reader_error: false,
        }
    }

    /// A normal removal: no token active, no fault.
    pub fn removed(source: impl Into<String>) -> Self {
        Scan {
            source: source.into(),
            token: None,
            error: None,
            reader_error: false,
        }
    }

    /// A fatal fault that ends polling while a token was (or might have been)
    /// active. Per §4.13 this is only correct to emit when an active token
    /// had previously been emitted and not yet cleared.
    pub fn reader_error(source: impl Into<String>) -> Self {
        Scan {
            source: source.into(),
            token: None,
            error: None,
            reader_error: true,
        }
    }

    /// A soft error with no presence claim at all.
    pub fn soft_error(source: impl Into<String>, error: impl Into<String>) -> Self {
        Scan {
            source: source.into(),
            token: None,
            error: Some(error.into()),
            reader_error: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_is_nfc_normalized() {
        // "e" + combining acute (NFD) should collapse to the precomposed "é" (NFC).
        let decomposed = "e\u{0301}";
        let tok = Token::new("", decomposed, TokenType::Unknown, "", "test:x");
        assert_eq!(tok.text, "\u{00e9}");
    }

    #[test]
    fn reader_error_scan_has_no_token() {
        let s = Scan::reader_error("pcsc:Reader 0");
        assert!(s.token.is_none());
        assert!(s.reader_error);
        assert!(s.error.is_none());
    }

    #[test]
    fn removed_scan_is_not_reader_error() {
        let s = Scan::removed("pcsc:Reader 0");
        assert!(s.token.is_none());
        assert!(!s.reader_error);
    }
}
