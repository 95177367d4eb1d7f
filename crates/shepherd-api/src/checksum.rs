//! Content checksums for playbook payloads

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `data`
///
/// The agent acks a dispatch with the checksum of the payload it unwrapped,
/// so both sides must agree on this function.
#[must_use]
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_known_value() {
        assert_eq!(
            checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_checksum_differs_by_content() {
        assert_ne!(checksum(b"- hosts: all"), checksum(b"- hosts: web"));
    }
}
