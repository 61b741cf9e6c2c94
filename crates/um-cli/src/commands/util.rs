//! Helpers shared by subcommands.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fs2::FileExt;

/// Path of the lock file guarding the database at `database_path`.
pub fn lock_path(database_path: &Path) -> PathBuf {
    let mut name = database_path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// Takes the single-writer lock for the database.
///
/// Only one process may credit or reconcile a ledger at a time; a second
/// agent or a manual flush while the agent runs would send the same deltas
/// twice. The lock is released when the returned file is dropped.
pub fn lock_writer(database_path: &Path) -> Result<File> {
    let path = lock_path(database_path);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .with_context(|| format!("failed to open lock file {}", path.display()))?;
    if file.try_lock_exclusive().is_err() {
        bail!(
            "another um process is using {}; stop the running agent first",
            database_path.display()
        );
    }
    Ok(file)
}

/// Formats seconds as `1h 5m`, `12m` or `40s`.
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{seconds}s");
    }
    let total_minutes = seconds / 60;
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;

    if hours >= 1 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}
