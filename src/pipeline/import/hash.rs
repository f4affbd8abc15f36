use base64::Engine;
use sha2::{Digest, Sha256};

/// SHA-256 content hash (base64) of an upload.
///
/// Retries of the same upload produce the same hash, which lets callers
/// correlate attempts even before a document id has been assigned.
pub fn compute_content_hash(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    base64::engine::general_purpose::STANDARD.encode(hash)
}
