//! Deterministic reader identity (§4.3, §3 "ReaderId").

use data_encoding::BASE32_NOPAD;
use sha2::{Digest, Sha256};

const HASH_PREFIX_BYTES: usize = 5;

/// Computes `{driver}-{8-char lowercase base32 hash}` from a driver name
/// and a stable device path.
///
/// Normalization: driver is lowercased; path is lowercased and has `\`
/// replaced with `/`, so the same physical reader yields the same id
/// whether observed from Windows or Unix conventions.
pub fn reader_id(driver: &str, path: &str) -> String {
    let driver_norm = driver.to_lowercase();
    let path_norm = path.to_lowercase().replace('\\', "/");

    let mut hasher = Sha256::new();
    hasher.update(driver_norm.as_bytes());
    hasher.update([0x00]);
    hasher.update(path_norm.as_bytes());
    let digest = hasher.finalize();

    let hash8 = BASE32_NOPAD
        .encode(&digest[..HASH_PREFIX_BYTES])
        .to_lowercase();

    format!("{driver_norm}-{hash8}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(reader_id("pn532", "1-2.3.1"), reader_id("pn532", "1-2.3.1"));
    }

    #[test]
    fn case_insensitive_driver_and_path_separator() {
        assert_eq!(
            reader_id("PN532", "1-2.3.1"),
            reader_id("pn532", "1-2.3.1")
        );
        assert_eq!(
            reader_id("file", "C:\\Users\\X\\t.txt"),
            reader_id("file", "c:/users/x/t.txt")
        );
    }

    #[test]
    fn begins_with_driver_and_has_8_char_hash() {
        let id = reader_id("PN532", "1-2.3.1");
        assert!(id.starts_with("pn532-"));
        let hash = id.strip_prefix("pn532-").unwrap();
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn differs_on_driver_or_path() {
        let base = reader_id("pcsc", "Reader 0");
        assert_ne!(base, reader_id("pcsc", "Reader 1"));
        assert_ne!(base, reader_id("libnfc", "Reader 0"));
    }
}
