//! Status command: per-domain totals, sync watermarks and the last flush.

use std::io::Write;

use anyhow::Result;
use chrono::SecondsFormat;

use um_core::{FlushRecord, UsageStore};
use um_db::Database;

use super::flush::build_client;
use super::util::format_duration;
use crate::Config;

pub fn run<W: Write>(writer: &mut W, db: &Database, config: &Config) -> Result<()> {
    writeln!(writer, "Usage meter status")?;
    writeln!(writer, "Database: {}", config.database_path.display())?;
    match config.collector() {
        Some(collector) => match build_client(&collector, config) {
            Ok(_) => writeln!(
                writer,
                "Collector: {} (user {})",
                collector.url, collector.user_id
            )?,
            Err(err) => writeln!(writer, "Collector: {} rejected: {err}", collector.url)?,
        },
        None => writeln!(writer, "Collector: not configured")?,
    }

    match db.last_flush()? {
        Some(attempt) => writeln!(writer, "Last flush: {}", describe_attempt(&attempt))?,
        None => writeln!(writer, "Last flush: never")?,
    }
    if let Some(delivered) = db.last_delivered_flush()? {
        writeln!(
            writer,
            "Last delivery: {}",
            delivered
                .attempted_at
                .to_rfc3339_opts(SecondsFormat::Secs, true)
        )?;
    }

    let usage = db.usage()?;
    if usage.is_empty() {
        writeln!(writer, "No usage recorded.")?;
        return Ok(());
    }

    writeln!(writer, "Domains:")?;
    for totals in &usage {
        writeln!(
            writer,
            "- {}: {} total, {} synced, {} pending",
            totals.key,
            format_duration(totals.seconds),
            format_duration(totals.acknowledged),
            format_duration(totals.pending())
        )?;
    }

    Ok(())
}

fn describe_attempt(attempt: &FlushRecord) -> String {
    let at = attempt.attempted_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    let size = format!(
        "{} domains, {}",
        attempt.entries,
        format_duration(attempt.seconds)
    );
    if attempt.delivered {
        format!("{at} delivered ({size})")
    } else {
        let reason = attempt.error.as_deref().unwrap_or("unknown error");
        format!("{at} failed ({size}): {reason}")
    }
}
