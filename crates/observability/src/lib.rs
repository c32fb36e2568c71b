//! Tracing/logging setup shared by every process that embeds the job engine.

/// Initialize process-wide logging from the environment (`LOG_LEVEL`, `LOG_FORMAT`, `RUST_LOG`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&LogConfig::from_env());
}

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use crate::tracing::{LogConfig, LogFormat};
