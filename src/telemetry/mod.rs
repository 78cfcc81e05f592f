//! Telemetry for the harness.
//!
//! Structured logging only; captured CLI output is kept per application in
//! [`crate::output::LogBuffer`] rather than in the global subscriber.

mod logging;

pub use logging::{init_logging, init_test_logging, LogConfig, LogError, LogFormat};
