//! Tracing and logging (shared setup).

/// Initialize process-wide tracing from settings.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(settings: &LoggingSettings) {
    tracing::init(settings);
}

/// Logging configuration.
pub mod settings;

/// Subscriber installation (filters, formats).
pub mod tracing;

pub use settings::{LogFormat, LoggingSettings};
