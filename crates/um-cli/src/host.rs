//! Host events read by the agent, one JSON object per line.

use anyhow::{Context, Result};
use serde::Deserialize;

use um_core::IdleState;

/// A focus or idle notification from the host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum HostEvent {
    /// Focus moved to `url`; `null` or absent means nothing is focused.
    Focus {
        #[serde(default)]
        url: Option<String>,
    },
    /// The host idle state changed.
    Idle { state: IdleState },
}

/// Parses one line of host input.
///
/// Blank lines yield `None`.
pub fn parse_host_event(line: &str) -> Result<Option<HostEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let event = serde_json::from_str(line)
        .with_context(|| format!("invalid host event: {line}"))?;
    Ok(Some(event))
}
