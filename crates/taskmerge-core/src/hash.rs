use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of file content, used to detect stale baselines.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}
