//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Per-domain usage meter.
///
/// Accumulates how long each website is actively in focus and reconciles the
/// totals with a remote collector, sending only what it has not yet
/// acknowledged.
#[derive(Debug, Parser)]
#[command(name = "um", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the metering agent, reading host focus/idle events from stdin.
    ///
    /// Each stdin line is a JSON event:
    /// {"event":"focus","url":"https://example.com/"} or
    /// {"event":"idle","state":"active|idle|locked"}.
    Run,

    /// Show per-domain totals, sync watermarks and the last flush.
    Status,

    /// Show per-domain usage for recent days.
    Report {
        /// Number of local days to include, ending today.
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=366))]
        days: u32,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Send pending usage to the collector now.
    Flush,

    /// Delete all local usage totals and sync watermarks.
    Reset {
        /// Confirm deletion.
        #[arg(long)]
        yes: bool,
    },

    /// Print the tracking key a URL resolves to.
    Resolve {
        /// The page URL.
        url: String,
    },
}
