use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use um_cli::commands::{flush, report, reset, resolve, run, status};
use um_cli::{Cli, Commands, Config};

/// Load config and open database, ensuring the parent directory exists.
fn open_database(config_path: Option<&Path>) -> Result<(um_db::Database, Config)> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let db = um_db::Database::open(&config.database_path).context("failed to open database")?;
    Ok((db, config))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with verbose flag support
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    // Logs go to stderr; stdout carries command output
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let mut stdout = std::io::stdout().lock();

    match &cli.command {
        Some(Commands::Run) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            run::run(db, &config, cli.config.as_deref())?;
        }
        Some(Commands::Status) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            status::run(&mut stdout, &db, &config)?;
        }
        Some(Commands::Report { days, json }) => {
            let (db, _config) = open_database(cli.config.as_deref())?;
            report::run(&mut stdout, &db, *days, *json)?;
        }
        Some(Commands::Flush) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            flush::run(&mut stdout, db, &config)?;
        }
        Some(Commands::Reset { yes }) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            reset::run(&mut stdout, db, &config, *yes)?;
        }
        Some(Commands::Resolve { url }) => {
            // Resolve doesn't need config or the database
            resolve::run(&mut stdout, url)?;
        }
        None => {
            // No subcommand, show help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
