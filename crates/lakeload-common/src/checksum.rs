//! Content checksums
//!
//! Row keys for tables without an `id` column and object etags in the
//! in-memory store are SHA-256 digests rendered as lowercase hex.

use sha2::{Digest, Sha256};

/// SHA-256 of a byte slice as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 over a sequence of fields.
///
/// Each field is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn sha256_fields<'a, I>(fields: I) -> String
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut hasher = Sha256::new();
    for field in fields {
        match field {
            Some(value) => {
                hasher.update((value.len() as u64).to_le_bytes());
                hasher.update(value.as_bytes());
            },
            None => hasher.update(u64::MAX.to_le_bytes()),
        }
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_sha256_fields_is_boundary_sensitive() {
        let a = sha256_fields([Some("ab"), Some("c")]);
        let b = sha256_fields([Some("a"), Some("bc")]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_sha256_fields_distinguishes_null_from_empty() {
        let null = sha256_fields([None]);
        let empty = sha256_fields([Some("")]);
        assert_ne!(null, empty);
        assert_eq!(null, sha256_fields([None]));
    }
}
