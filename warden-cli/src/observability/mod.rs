//! Logging setup for the `warden` binary.
//!
//! The output format is controlled via `WARDEN_LOG_FORMAT`:
//! - `json` - Structured JSON output (for ELK/Loki)
//! - `pretty` - Human-readable colored output (default for TTY)
//! - `compact` - Compact single-line format (default for non-TTY)
//!
//! The filter comes from `RUST_LOG`, falling back to the `-v` count.

mod config;
mod tracing_setup;

pub use config::{LogFormat, TracingConfig};
pub use tracing_setup::{TracingGuard, init_tracing};
