//! Observability for the container test environment.
//!
//! Provides structured logging setup on top of `tracing` and
//! `tracing-subscriber`. Every crate in the workspace logs through the
//! `tracing` macros; binaries and test runners install a subscriber once via
//! [`init_tracing`] or [`try_init_tracing`].

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, try_init_tracing, TracingConfig, TracingError};

/// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, instrument, trace, warn, span, Level};
