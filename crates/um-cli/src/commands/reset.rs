//! Reset command: wipes local totals and watermarks.

use std::io::Write;

use anyhow::{Result, bail};

use um_db::Database;

use super::util::lock_writer;
use crate::Config;

pub fn run<W: Write>(writer: &mut W, mut db: Database, config: &Config, yes: bool) -> Result<()> {
    if !yes {
        bail!("reset deletes all local usage, including time not yet sent; pass --yes to confirm");
    }
    let _lock = lock_writer(&config.database_path)?;

    let removed = db.reset()?;
    tracing::info!(removed, "usage reset");
    writeln!(writer, "Removed usage for {removed} domains.")?;
    Ok(())
}
