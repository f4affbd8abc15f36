//! Repository layer: entity-scoped database operations.

mod error_log;

pub use error_log::*;
