//! One-shot reconciliation pass.

use std::io::Write;

use anyhow::{Context, Result, bail};

use um_collector::{CollectorClient, CollectorError};
use um_core::{Engine, FlushOutcome};
use um_db::Database;

use super::util::{format_duration, lock_writer};
use crate::{CollectorSettings, Config};

pub fn build_client(
    settings: &CollectorSettings,
    config: &Config,
) -> Result<CollectorClient, CollectorError> {
    CollectorClient::new(
        &settings.url,
        settings.api_key.as_str(),
        settings.user_id.clone(),
        config.request_timeout(),
    )
}

/// Builds a collector client from settings, logging instead of failing when
/// the settings are unusable.
pub fn connect(settings: Option<&CollectorSettings>, config: &Config) -> Option<CollectorClient> {
    let settings = settings?;
    match build_client(settings, config) {
        Ok(client) => Some(client),
        Err(err) => {
            tracing::warn!(url = %settings.url, error = %err, "collector settings rejected");
            None
        }
    }
}

/// Human-readable summary of a flush.
pub fn describe(outcome: &FlushOutcome) -> String {
    match outcome {
        FlushOutcome::NotConfigured => "Collector not configured; nothing sent.".to_string(),
        FlushOutcome::InFlight => "Another flush is in progress.".to_string(),
        FlushOutcome::Empty => "Nothing to send.".to_string(),
        FlushOutcome::Delivered { entries, seconds } => {
            format!("Delivered {entries} domains ({}).", format_duration(*seconds))
        }
        FlushOutcome::Failed {
            entries,
            seconds,
            reason,
        } => format!(
            "Flush failed: {reason}. {entries} domains ({}) remain pending.",
            format_duration(*seconds)
        ),
    }
}

pub fn run<W: Write>(writer: &mut W, db: Database, config: &Config) -> Result<()> {
    let _lock = lock_writer(&config.database_path)?;

    let transport = match config.collector() {
        Some(settings) => Some(
            build_client(&settings, config)
                .with_context(|| format!("collector settings rejected for {}", settings.url))?,
        ),
        None => None,
    };
    let engine = Engine::new(db, transport, config.request_timeout());

    let runtime = tokio::runtime::Runtime::new().context("failed to initialize tokio runtime")?;
    let outcome = runtime
        .block_on(engine.flush())
        .context("failed to reconcile usage")?;

    writeln!(writer, "{}", describe(&outcome))?;
    if matches!(outcome, FlushOutcome::Failed { .. }) {
        bail!("usage was not delivered");
    }
    Ok(())
}
