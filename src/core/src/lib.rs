//! Berth Core - Foundational Types
//!
//! Error and configuration types shared by the Berth container engine
//! crates. Nothing in here performs I/O beyond reading a config file.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{DaemonConfig, LogLevel, StreamingConfig};
pub use error::{BerthError, Result};

/// Berth version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
