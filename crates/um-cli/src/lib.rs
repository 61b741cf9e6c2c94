//! Usage meter CLI library.
//!
//! This crate provides the `um` command: the metering agent and the commands
//! that inspect, reconcile and reset its local ledger.

mod cli;
pub mod commands;
mod config;
pub mod host;

pub use cli::{Cli, Commands};
pub use config::{CollectorSettings, Config};
