//! Resolve command: shows which tracking key a URL is credited to.

use std::io::Write;

use anyhow::Result;

pub fn run<W: Write>(writer: &mut W, url: &str) -> Result<()> {
    match um_core::resolve(url) {
        Some(key) => writeln!(writer, "{key}")?,
        None => writeln!(writer, "not tracked")?,
    }
    Ok(())
}
