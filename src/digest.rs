//! Digest and timestamp helpers shared by every entity
//!
//! All commitments in the blobber use SHA-256 rendered as lowercase hex.

use sha2::{Digest, Sha256};

/// Raw SHA-256 digest of data
pub fn hash_bytes(data: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    hasher.finalize().into()
}

/// Hex-encoded SHA-256 digest of data
pub fn hash(data: impl AsRef<[u8]>) -> String {
    hex::encode(hash_bytes(data))
}

/// Current unix time in seconds
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_hex_sha256() {
        assert_eq!(
            hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(hash("").len(), 64);
    }
}
