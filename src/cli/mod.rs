//! CLI module
//!
//! Command-line arguments and the client configuration built from them.

pub mod args;
pub mod config;

pub use args::CliArgs;
pub use config::ClientConfig;
