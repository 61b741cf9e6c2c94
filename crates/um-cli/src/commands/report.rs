//! Report command: per-domain usage over recent local days.

use std::fmt::Write as _;
use std::io::Write;

use anyhow::Result;
use chrono::{Days, Local, NaiveDate};
use serde::Serialize;

use um_db::{DailyUsage, Database};

use super::util::format_duration;

/// Computed report data.
#[derive(Debug)]
pub struct ReportData {
    /// First local day included.
    pub from: NaiveDate,
    /// Last local day included.
    pub to: NaiveDate,
    pub timezone: String,
    /// Ordered by seconds descending.
    pub usage: Vec<DailyUsage>,
}

impl ReportData {
    fn total_seconds(&self) -> u64 {
        self.usage.iter().map(|entry| entry.seconds).sum()
    }
}

/// Integer percentage of `value` in `total`, rounded half up.
pub fn share_percent(value: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    (value.saturating_mul(100) + total / 2) / total
}

/// Generates a 10-character progress bar.
/// Values <5% of max get a single block for visibility.
pub fn progress_bar(value: u64, max: u64) -> String {
    if max == 0 {
        return "░".repeat(10);
    }

    let filled = if value > 0 && value.saturating_mul(20) < max {
        1
    } else {
        let tenths = (value.saturating_mul(10) + max / 2) / max;
        usize::try_from(tenths.min(10)).unwrap_or(10)
    };

    format!("{}{}", "█".repeat(filled), "░".repeat(10 - filled))
}

/// Collects usage for the `days` local days ending on `today`.
pub fn generate_report_data(
    db: &Database,
    days: u32,
    today: NaiveDate,
    timezone: String,
) -> Result<ReportData> {
    let back = u64::from(days.max(1) - 1);
    let from = today.checked_sub_days(Days::new(back)).unwrap_or(NaiveDate::MIN);
    let usage = db.daily_usage(from, today)?;
    Ok(ReportData {
        from,
        to: today,
        timezone,
        usage,
    })
}

/// Formats report data as human-readable text.
pub fn format_report(data: &ReportData) -> String {
    let mut output = String::new();

    let header = if data.from == data.to {
        format!("Usage on {} ({})", data.from, data.timezone)
    } else {
        format!("Usage from {} to {} ({})", data.from, data.to, data.timezone)
    };
    let _ = writeln!(output, "{header}");
    let _ = writeln!(output, "{}", "─".repeat(header.chars().count()));

    if data.usage.is_empty() {
        let _ = writeln!(output, "No usage recorded.");
        return output;
    }

    let total = data.total_seconds();
    let max = data.usage.first().map_or(0, |entry| entry.seconds);
    for entry in &data.usage {
        let _ = writeln!(
            output,
            "{:<28} {:>7}  {:>3}%  {}",
            entry.key.as_str(),
            format_duration(entry.seconds),
            share_percent(entry.seconds, total),
            progress_bar(entry.seconds, max)
        );
    }
    let _ = writeln!(output, "─────");
    let _ = writeln!(output, "{:<28} {:>7}", "Total", format_duration(total));

    output
}

#[derive(Debug, Serialize)]
pub struct JsonReport {
    pub from: String,
    pub to: String,
    pub timezone: String,
    pub total_seconds: u64,
    pub domains: Vec<JsonDomain>,
}

#[derive(Debug, Serialize)]
pub struct JsonDomain {
    pub key: String,
    pub seconds: u64,
    pub share_percent: u64,
}

/// Formats report data as JSON.
pub fn format_report_json(data: &ReportData) -> Result<String> {
    let total = data.total_seconds();
    let report = JsonReport {
        from: data.from.to_string(),
        to: data.to.to_string(),
        timezone: data.timezone.clone(),
        total_seconds: total,
        domains: data
            .usage
            .iter()
            .map(|entry| JsonDomain {
                key: entry.key.to_string(),
                seconds: entry.seconds,
                share_percent: share_percent(entry.seconds, total),
            })
            .collect(),
    };
    Ok(serde_json::to_string_pretty(&report)?)
}

pub fn run<W: Write>(writer: &mut W, db: &Database, days: u32, json: bool) -> Result<()> {
    let today = Local::now().date_naive();
    let timezone = iana_time_zone::get_timezone().unwrap_or_else(|_| "UTC".to_string());
    let data = generate_report_data(db, days, today, timezone)?;

    if json {
        writeln!(writer, "{}", format_report_json(&data)?)?;
    } else {
        write!(writer, "{}", format_report(&data))?;
    }

    Ok(())
}
