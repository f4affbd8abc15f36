pub mod config;
pub mod db;
pub mod pipeline;

use tracing_subscriber::EnvFilter;

pub use pipeline::cancel::CancelFlag;
pub use pipeline::processor::{
    DocumentProcessor, DocumentRequest, ExtractionResult, Outcome, ProcessingError,
};

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` overrides the default filter. Safe to call more than once;
/// later calls are no-ops when a subscriber is already set.
pub fn init_tracing() {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("{} v{} tracing initialized", config::APP_NAME, config::APP_VERSION);
    }
}
