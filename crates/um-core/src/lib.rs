//! Tracking and reconciliation engine for the usage meter.
//!
//! This crate contains:
//! - Domain resolution: page URL to tracking key
//! - Activity tracking: attributing elapsed time under focus/idle changes
//! - Delta reconciliation: sending only unacknowledged seconds to the collector
//! - The [`Engine`] that serializes all of the above over a store and a transport

mod domain;
mod engine;
mod reconcile;
mod store;
mod tracker;
mod transport;
pub mod types;

pub use domain::resolve;
pub use engine::{DEFAULT_FLUSH_TIMEOUT, Engine, FlushOutcome};
pub use reconcile::{Batch, DeltaEntry, UsageTotals, compute_batch};
pub use store::{FlushRecord, UsageStore};
pub use tracker::{ActivityTracker, Credit};
pub use transport::Transport;
pub use types::{IdleState, TrackingKey, UserId, ValidationError};
