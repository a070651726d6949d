//! Checksum utilities: file/stream SHA-256 and the errors fingerprint.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Compute the SHA-256 of a file's raw bytes
pub fn file_sha256(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    stream_sha256(&mut file)
}

/// Compute the SHA-256 of any readable source
pub fn stream_sha256<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// An incrementally updated SHA-256, used by the extractor to hash sheet
/// content row by row without buffering the sheet.
#[derive(Default)]
pub struct RollingSha256 {
    hasher: Sha256,
}

impl RollingSha256 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Normalize one fingerprint field: trim, lowercase, collapse internal
/// whitespace to a single space. NULL is the empty string.
pub fn normalize_field(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic fingerprint over an error's identifying fields.
///
/// Fields are normalized, joined with `|`, and hashed with SHA-256. The SQL
/// digest path in the merger must produce byte-identical hex output.
pub fn fingerprint<S: AsRef<str>>(parts: &[S]) -> String {
    let joined = parts
        .iter()
        .map(|p| normalize_field(p.as_ref()))
        .collect::<Vec<_>>()
        .join("|");
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_stream_sha256() {
        let data = b"hello world";
        let mut cursor = Cursor::new(data);
        let checksum = stream_sha256(&mut cursor).unwrap();
        assert_eq!(checksum, "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
    }

    #[test]
    fn test_rolling_sha256_matches_stream() {
        let mut rolling = RollingSha256::new();
        rolling.update(b"hello ");
        rolling.update(b"world");
        assert_eq!(
            rolling.finish(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_normalize_field() {
        assert_eq!(normalize_field("  Crack   ON hull "), "crack on hull");
        assert_eq!(normalize_field(""), "");
        assert_eq!(normalize_field("  \t\n "), "");
    }

    #[test]
    fn test_normalize_field_strips_edge_tabs_and_newlines() {
        // cells reach this path untrimmed; tabs and newlines at the edges
        // must normalize away just like spaces
        assert_eq!(normalize_field("Crack on hull\t"), "crack on hull");
        assert_eq!(normalize_field("\nCrack\ton hull "), "crack on hull");
    }

    #[test]
    fn test_fingerprint_fixed_vector() {
        let fp = fingerprint(&["Crack on hull", "OF1001", "12", "2", "E77", "E45"]);
        assert_eq!(fp, "7f663a5902a86e3610a5710f78c63817682a150f6c83227928b32dca75b24263");
    }

    #[test]
    fn test_fingerprint_normalization_invariance() {
        let a = fingerprint(&["Crack on hull", "OF1001", "12", "2", "E77", "E45"]);
        let b = fingerprint(&["  Crack   ON hull ", "of1001", "12", "2", "e77", "e45"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_edge_whitespace_invariance() {
        // trailing tabs/newlines hash identically to the clean form; the
        // SQL digest path is required to agree byte for byte
        let fp = fingerprint(&["Crack on hull\t", "OF1001\n", "12", "2", "\tE77", "E45"]);
        assert_eq!(fp, "7f663a5902a86e3610a5710f78c63817682a150f6c83227928b32dca75b24263");
    }

    #[test]
    fn test_fingerprint_all_empty() {
        let fp = fingerprint(&["", "", "", "", "", ""]);
        assert_eq!(fp, "1867f76f89b18a0f04c72020a91ed03b5557354322022ed5b08d045d20b8689c");
    }

    #[test]
    fn test_fingerprint_missing_tail_fields() {
        let fp = fingerprint(&["Gel coat blister", "OF2002", "7", "1", "", ""]);
        assert_eq!(fp, "185669d80151b3d1c56c6db3079b677f2815d5cd19673fcf05920dfc7b5b8ccb");
    }
}
