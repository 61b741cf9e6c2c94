//! CLI subcommand implementations.

pub mod flush;
pub mod report;
pub mod reset;
pub mod resolve;
pub mod run;
pub mod status;
pub mod util;
