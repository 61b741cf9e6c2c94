//! Delta computation between the usage ledger and the sync watermarks.

use serde::Serialize;
use uuid::Uuid;

use crate::types::TrackingKey;

/// One key's cumulative totals as read from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub key: TrackingKey,
    /// Cumulative seconds observed.
    pub seconds: u64,
    /// Cumulative seconds acknowledged by the collector.
    pub acknowledged: u64,
}

impl UsageTotals {
    /// Seconds not yet acknowledged.
    #[must_use]
    pub const fn pending(&self) -> u64 {
        self.seconds.saturating_sub(self.acknowledged)
    }
}

/// Unacknowledged seconds for a single key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeltaEntry {
    pub key: TrackingKey,
    pub seconds: u64,
}

/// Everything one flush sends in a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Correlates log lines and the flush log row for this attempt.
    pub id: Uuid,
    pub entries: Vec<DeltaEntry>,
}

impl Batch {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all entry deltas.
    #[must_use]
    pub fn total_seconds(&self) -> u64 {
        self.entries.iter().map(|entry| entry.seconds).sum()
    }
}

/// Builds the outgoing batch from a store snapshot.
///
/// Only keys with a positive delta are included, ordered by key so request
/// bodies are deterministic.
#[must_use]
pub fn compute_batch(snapshot: &[UsageTotals]) -> Batch {
    let mut entries: Vec<DeltaEntry> = snapshot
        .iter()
        .filter_map(|row| {
            if row.acknowledged > row.seconds {
                tracing::warn!(
                    key = %row.key,
                    seconds = row.seconds,
                    acknowledged = row.acknowledged,
                    "watermark above ledger total; sending nothing for key"
                );
                return None;
            }
            let seconds = row.pending();
            (seconds > 0).then(|| DeltaEntry {
                key: row.key.clone(),
                seconds,
            })
        })
        .collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    Batch {
        id: Uuid::new_v4(),
        entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals(key: &str, seconds: u64, acknowledged: u64) -> UsageTotals {
        UsageTotals {
            key: TrackingKey::new(key).unwrap(),
            seconds,
            acknowledged,
        }
    }

    #[test]
    fn includes_only_positive_deltas() {
        let batch = compute_batch(&[
            totals("a.com", 15, 0),
            totals("b.com", 20, 20),
            totals("c.com", 30, 12),
        ]);
        let rendered: Vec<_> = batch
            .entries
            .iter()
            .map(|e| (e.key.as_str(), e.seconds))
            .collect();
        assert_eq!(rendered, vec![("a.com", 15), ("c.com", 18)]);
        assert_eq!(batch.total_seconds(), 33);
    }

    #[test]
    fn entries_are_sorted_by_key() {
        let batch = compute_batch(&[totals("z.org", 1, 0), totals("a.org", 1, 0), totals("m.org", 1, 0)]);
        let keys: Vec<_> = batch.entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a.org", "m.org", "z.org"]);
    }

    #[test]
    fn fully_acknowledged_snapshot_is_empty() {
        let batch = compute_batch(&[totals("a.com", 15, 15)]);
        assert!(batch.is_empty());
        assert_eq!(batch.total_seconds(), 0);
        assert!(compute_batch(&[]).is_empty());
    }

    #[test]
    fn watermark_above_total_is_skipped() {
        let batch = compute_batch(&[totals("a.com", 10, 12), totals("b.com", 5, 0)]);
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].key.as_str(), "b.com");
    }

    #[test]
    fn pending_saturates() {
        assert_eq!(totals("a.com", 10, 12).pending(), 0);
        assert_eq!(totals("a.com", 12, 10).pending(), 2);
    }
}
