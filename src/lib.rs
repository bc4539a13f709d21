#![deny(rust_2024_compatibility)]
// Specific pedantic lints enforced (not blanket allow):
#![deny(
    clippy::explicit_iter_loop,
    clippy::manual_let_else,
    clippy::semicolon_if_nothing_returned,
    clippy::inconsistent_struct_constructor
)]
// Noisy pedantic lints suppressed with justification:
#![allow(
    clippy::cast_lossless,            // Infallible casts are clear enough with `as`
    clippy::cast_possible_truncation, // Safe within realistic value bounds (durations, sizes)
    clippy::cast_possible_wrap,       // Safe in non-negative contexts
    clippy::cast_precision_loss,      // Acceptable for metrics/display
    clippy::cast_sign_loss,           // Safe where values are known non-negative
    clippy::missing_errors_doc,       // Internal API
    clippy::missing_panics_doc,       // Internal API
    clippy::module_name_repetitions,  // e.g. SinkError in sink module
    clippy::must_use_candidate,       // Annotated selectively on critical APIs
    clippy::doc_markdown              // Internal API
)]

//! Syslog ingestion and delivery core.
//!
//! Shared UDP/TCP listeners route messages by peer IP to sources; each source
//! batches, filters and aggregates its traffic and fans it out to storage and
//! HEC destinations, while keeping rolling throughput metrics.

pub mod app;
pub mod buffer;
pub mod dispatch;
pub mod domain;
pub mod filter;
pub mod listener;
pub mod metrics;
pub mod reliability;
pub mod sink;
pub mod source;

pub use app::{Config, Relay};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
