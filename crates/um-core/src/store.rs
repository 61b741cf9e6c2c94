//! Durable storage seam for the usage ledger and sync watermarks.

use chrono::{DateTime, Utc};

use crate::reconcile::{DeltaEntry, UsageTotals};
use crate::types::TrackingKey;

/// Durable key-value storage behind the accumulator and watermark store.
///
/// Every mutating call must be durable before it returns `Ok`: a credit that
/// returns is never lost on restart, and a failed call applies nothing.
pub trait UsageStore {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Adds `seconds` to the cumulative total for `key`, observed at `at`.
    ///
    /// Returns the new cumulative total.
    fn credit(&mut self, key: &TrackingKey, seconds: u64, at: DateTime<Utc>) -> Result<u64, Self::Error>;

    /// A consistent snapshot of every key's total and acknowledged seconds.
    fn usage(&self) -> Result<Vec<UsageTotals>, Self::Error>;

    /// Advances each key's watermark by exactly the entry's delta.
    ///
    /// All-or-nothing: an advance that would put a watermark above its
    /// ledger total fails the whole call.
    fn acknowledge(&mut self, entries: &[DeltaEntry], at: DateTime<Utc>) -> Result<(), Self::Error>;

    /// Records the outcome of a network flush attempt for status reporting.
    ///
    /// The default implementation keeps no history.
    fn record_flush(&mut self, attempt: &FlushRecord) -> Result<(), Self::Error> {
        let _ = attempt;
        Ok(())
    }
}

/// One attempted delivery, as shown by `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushRecord {
    pub batch_id: String,
    pub attempted_at: DateTime<Utc>,
    pub entries: usize,
    pub seconds: u64,
    pub delivered: bool,
    pub error: Option<String>,
}
