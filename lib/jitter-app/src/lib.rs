//! High-level application primitives.
//!
//! This crate provides the pieces needed to bootstrap the service before it starts serving, and to tear it down
//! afterwards: logging, telemetry, the API surface, and shutdown signals.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod api;
pub mod logging;
pub mod signals;
pub mod telemetry;
pub mod trace_context;

/// Common imports.
pub mod prelude {
    pub use super::logging::{fatal_and_exit, initialize_logging};
    pub use super::signals::wait_for_shutdown_signal;
    pub use super::telemetry::{initialize_telemetry, TelemetryHandle};
}
