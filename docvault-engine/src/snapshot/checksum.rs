//! CRC32 checksums for chunk bodies and manifests.
//!
//! Stored as `crc32:xxxxxxxx` (lowercase hex, zero-padded).

use crc32fast::Hasher;

pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

pub fn format_checksum(checksum: u32) -> String {
    format!("crc32:{:08x}", checksum)
}

/// Parse a `crc32:xxxxxxxx` string. Returns `None` if the format is invalid.
pub fn parse_checksum(formatted: &str) -> Option<u32> {
    let hex = formatted.strip_prefix("crc32:")?;
    if hex.len() != 8 {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

/// Checksum of `data`, formatted.
pub fn checksum_of(data: &[u8]) -> String {
    format_checksum(compute_checksum(data))
}

/// Compare `data` against a formatted checksum, describing any mismatch.
pub fn verify_checksum(data: &[u8], expected: &str) -> Result<(), String> {
    let expected_value =
        parse_checksum(expected).ok_or_else(|| format!("malformed checksum {expected:?}"))?;
    let actual = compute_checksum(data);
    if actual == expected_value {
        Ok(())
    } else {
        Err(format!(
            "checksum mismatch: expected {}, found {}",
            expected,
            format_checksum(actual)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_detects_changes() {
        assert_eq!(compute_checksum(b"orders"), compute_checksum(b"orders"));
        assert_ne!(compute_checksum(b"orders"), compute_checksum(b"orderz"));
    }

    #[test]
    fn test_format_and_parse() {
        assert_eq!(format_checksum(0xDEADBEEF), "crc32:deadbeef");
        assert_eq!(format_checksum(0x1), "crc32:00000001");
        assert_eq!(parse_checksum("crc32:deadbeef"), Some(0xDEADBEEF));
        assert_eq!(parse_checksum("md5:deadbeef"), None);
        assert_eq!(parse_checksum("crc32:beef"), None);
        assert_eq!(parse_checksum("crc32:nothex!!"), None);
    }

    #[test]
    fn test_verify() {
        let sum = checksum_of(b"payload");
        assert!(verify_checksum(b"payload", &sum).is_ok());
        let err = verify_checksum(b"payloaD", &sum).unwrap_err();
        assert!(err.contains("checksum mismatch"));
        assert!(verify_checksum(b"payload", "garbage").is_err());
    }
}
