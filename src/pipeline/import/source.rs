use std::sync::Arc;

use super::format::sanitize_filename;

/// One uploaded file, immutable for the lifetime of an extraction attempt.
///
/// Bytes are reference-counted so blocking extractor tasks can hold them
/// without copying the upload.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub bytes: Arc<[u8]>,
    pub filename: String,
    pub declared_mime: String,
    pub declared_size: u64,
}

impl SourceDocument {
    /// Wrap uploaded bytes. The filename is sanitized; the declared size
    /// defaults to the byte length.
    pub fn new(bytes: Vec<u8>, filename: &str, declared_mime: &str) -> Self {
        let declared_size = bytes.len() as u64;
        Self {
            bytes: Arc::from(bytes),
            filename: sanitize_filename(filename),
            declared_mime: declared_mime.to_string(),
            declared_size,
        }
    }

    /// Override the size reported by the upload layer.
    pub fn with_declared_size(mut self, size: u64) -> Self {
        self.declared_size = size;
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
