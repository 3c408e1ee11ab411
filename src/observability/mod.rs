//! Observability: structured logging and connection metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{ConnectionMetrics, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{connection_span, lifecycle_span};
