//! Observability: structured logging and span helpers

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{publish_span, session_span, subscribe_span};
