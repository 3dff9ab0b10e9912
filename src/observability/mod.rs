//! Observability for the notify client
//!
//! Structured logging through `tracing`, with span macros shared by the client
//! facade and the consumer transports.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{consumer_span, lifecycle_span, node_span};
