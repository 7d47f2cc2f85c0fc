#![forbid(unsafe_code)]

//! Database administration utilities.
//!
//! Entry points used by the `tandem` CLI: statistics reporting, on-demand
//! checkpoints, and the two-connection concurrency demo. Every report type
//! serializes with serde so the CLI can print it as text or JSON.

mod checkpoint;
mod demo;
mod error;
mod stats;

/// Folds committed WAL frames into the page store on demand.
pub use checkpoint::{checkpoint, CheckpointReport};

/// Long write plus delayed read against one database file.
pub use demo::{run_concurrency_demo, DemoOptions, DemoReport};

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Statistics collection and reporting.
pub use stats::{
    stats, FilesystemStats, SessionStatsSection, StatsReport, StoreStatsSection, WalStatsSection,
};
