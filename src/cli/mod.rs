//! CLI module
//!
//! Command-line interface for the downloader and the DHT crawler.

pub mod args;
pub mod config;

pub use args::{CliArgs, Command, DhtArgs};
pub use config::{Config, Mode};
