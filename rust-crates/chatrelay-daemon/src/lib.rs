//! chatrelay daemon library
//!
//! Configuration and command line handling, exposed for integration testing.

pub mod cli;
pub mod config;

pub use cli::Cli;
pub use config::DaemonConfig;
