pub mod analysis;
pub mod cancel;
pub mod diagnostics; // Error classification, redaction and log sinks
pub mod extraction;
pub mod import;
pub mod ollama;
pub mod processor; // Attempt state machine: detect, extract, fall back, analyze
