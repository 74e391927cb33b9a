//! Observability: structured logging setup and span macros.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{dispatch_span, link_span};
