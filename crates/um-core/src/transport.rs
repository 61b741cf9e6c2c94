//! Outbound seam to the remote collector.

use std::future::Future;

use crate::reconcile::Batch;

/// Sends a batch of deltas to the remote collector.
///
/// Acknowledgement is all-or-nothing: `Ok` means the collector accepted every
/// entry, anything else means none of them count as delivered.
pub trait Transport: Send + Sync {
    type Error: std::fmt::Display + Send;

    fn send(&self, batch: &Batch) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
