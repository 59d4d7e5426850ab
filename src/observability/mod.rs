//! # Observability
//!
//! Prometheus metrics for decryption. Tracing spans are created where the
//! work happens.

pub mod metrics;

// Re-export for convenience
pub use metrics::*;
