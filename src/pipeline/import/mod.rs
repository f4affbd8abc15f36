pub mod format;
pub mod hash;
pub mod source;

pub use format::*;
pub use hash::*;
pub use source::*;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImportError {
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("File size exceeds the limit of {max_mb}MB")]
    FileTooLarge { size_bytes: u64, max_mb: u64 },

    #[error("File is empty")]
    EmptyFile,
}
