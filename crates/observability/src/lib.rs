//! Tracing and logging setup shared by the server and the maintenance CLI.

/// Initialize process-wide JSON logging for the HTTP service.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize human-readable logging for interactive tools.
pub fn init_cli() {
    tracing::init_cli();
}

/// Tracing configuration (filters, layers).
pub mod tracing;
