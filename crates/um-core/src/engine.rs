//! The serialized tracking-and-reconciliation engine.
//!
//! # Concurrency
//!
//! The tracker and the store live behind one async mutex; every focus, idle
//! and tick operation runs to completion under it, so no two credits
//! interleave. Flushes take the same lock only to snapshot and to advance
//! watermarks. The network call runs with the lock released so ticks keep
//! going, and a separate gate keeps at most one flush in flight.
//!
//! Watermarks advance by the deltas computed from the snapshot, never by a
//! re-read of the ledger, so time credited while a request is in flight stays
//! pending for the next flush.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::domain::resolve;
use crate::reconcile::{UsageTotals, compute_batch};
use crate::store::{FlushRecord, UsageStore};
use crate::tracker::{ActivityTracker, Credit};
use crate::transport::Transport;
use crate::types::IdleState;

/// Default bound on a single collector request.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// No collector configured; nothing sent, nothing changed.
    NotConfigured,
    /// Another flush was still running; this one was skipped.
    InFlight,
    /// Every key is fully acknowledged; no request made.
    Empty,
    /// The collector accepted the batch and watermarks advanced.
    Delivered { entries: usize, seconds: u64 },
    /// The request failed or timed out; watermarks unchanged.
    Failed {
        entries: usize,
        seconds: u64,
        reason: String,
    },
}

struct State<S> {
    tracker: ActivityTracker,
    store: S,
}

/// Owns the accounting state, the store and the collector transport.
pub struct Engine<S, T> {
    state: Mutex<State<S>>,
    transport: RwLock<Option<Arc<T>>>,
    flush_gate: Mutex<()>,
    flush_timeout: Duration,
}

impl<S, T> Engine<S, T>
where
    S: UsageStore + Send,
    T: Transport,
{
    /// Creates an engine whose accounting boundary starts now.
    pub fn new(store: S, transport: Option<T>, flush_timeout: Duration) -> Self {
        Self::starting_at(store, transport, flush_timeout, Utc::now())
    }

    /// Creates an engine whose accounting boundary starts at `now`.
    pub fn starting_at(
        store: S,
        transport: Option<T>,
        flush_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            state: Mutex::new(State {
                tracker: ActivityTracker::new(now),
                store,
            }),
            transport: RwLock::new(transport.map(Arc::new)),
            flush_gate: Mutex::new(()),
            flush_timeout,
        }
    }

    /// Replaces the collector transport; `None` turns flushes into no-ops.
    pub async fn set_transport(&self, transport: Option<T>) {
        *self.transport.write().await = transport.map(Arc::new);
    }

    pub async fn has_transport(&self) -> bool {
        self.transport.read().await.is_some()
    }

    /// Host focus moved to `url` (`None` when nothing is focused).
    pub async fn focus_changed(&self, url: Option<&str>) -> Result<Option<Credit>, S::Error> {
        self.focus_changed_at(url, Utc::now()).await
    }

    /// Host focus moved to `url` at `now`.
    ///
    /// The host state change applies even if persisting the previous
    /// interval fails; that interval is then lost and the error returned.
    pub async fn focus_changed_at(
        &self,
        url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Credit>, S::Error> {
        let key = url.and_then(resolve);
        let mut state = self.state.lock().await;
        tracing::debug!(key = key.as_ref().map(|k| k.as_str()), "focus changed");
        let credit = state.tracker.focus_changed(key, now);
        persist(&mut state.store, credit, now)
    }

    pub async fn idle_changed(&self, idle: IdleState) -> Result<Option<Credit>, S::Error> {
        self.idle_changed_at(idle, Utc::now()).await
    }

    /// Host idle state changed at `now`.
    pub async fn idle_changed_at(
        &self,
        idle: IdleState,
        now: DateTime<Utc>,
    ) -> Result<Option<Credit>, S::Error> {
        let mut state = self.state.lock().await;
        tracing::debug!(state = %idle, "idle state changed");
        let credit = state.tracker.idle_changed(idle.is_idle(), now);
        persist(&mut state.store, credit, now)
    }

    pub async fn tick(&self) -> Result<Option<Credit>, S::Error> {
        self.tick_at(Utc::now()).await
    }

    /// Credits time elapsed since the boundary to the focused key.
    ///
    /// The boundary only advances once the credit is durable, so a failed
    /// write is retried in full by the next tick.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<Option<Credit>, S::Error> {
        let mut state = self.state.lock().await;
        let credit = state.tracker.pending(now);
        let credit = persist(&mut state.store, credit, now)?;
        state.tracker.advance_tick(now);
        Ok(credit)
    }

    /// Read-only snapshot of every key's totals.
    pub async fn usage(&self) -> Result<Vec<UsageTotals>, S::Error> {
        self.state.lock().await.store.usage()
    }

    /// Runs one reconciliation pass.
    ///
    /// Transport failures and timeouts are reported as
    /// [`FlushOutcome::Failed`], not as errors; only store failures are
    /// errors.
    pub async fn flush(&self) -> Result<FlushOutcome, S::Error> {
        let Ok(_gate) = self.flush_gate.try_lock() else {
            tracing::debug!("flush already in flight; skipping");
            return Ok(FlushOutcome::InFlight);
        };

        let Some(transport) = self.transport.read().await.clone() else {
            tracing::debug!("collector not configured; skipping flush");
            return Ok(FlushOutcome::NotConfigured);
        };

        let batch = {
            let state = self.state.lock().await;
            compute_batch(&state.store.usage()?)
        };
        if batch.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        let entries = batch.entries.len();
        let seconds = batch.total_seconds();
        tracing::debug!(batch = %batch.id, entries, seconds, "sending batch");

        let result = tokio::time::timeout(self.flush_timeout, transport.send(&batch)).await;
        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some(format!(
                "timed out after {}s",
                self.flush_timeout.as_secs_f64()
            )),
        };

        let now = Utc::now();
        let mut state = self.state.lock().await;
        if failure.is_none() {
            state.store.acknowledge(&batch.entries, now)?;
        }

        let record = FlushRecord {
            batch_id: batch.id.to_string(),
            attempted_at: now,
            entries,
            seconds,
            delivered: failure.is_none(),
            error: failure.clone(),
        };
        if let Err(err) = state.store.record_flush(&record) {
            tracing::warn!(batch = %batch.id, error = %err, "failed to record flush attempt");
        }

        Ok(match failure {
            None => {
                tracing::info!(batch = %batch.id, entries, seconds, "batch delivered");
                FlushOutcome::Delivered { entries, seconds }
            }
            Some(reason) => {
                tracing::warn!(batch = %batch.id, entries, seconds, %reason, "flush failed; deltas kept");
                FlushOutcome::Failed {
                    entries,
                    seconds,
                    reason,
                }
            }
        })
    }
}

fn persist<S: UsageStore>(
    store: &mut S,
    credit: Option<Credit>,
    now: DateTime<Utc>,
) -> Result<Option<Credit>, S::Error> {
    if let Some(credit) = &credit {
        let total = store.credit(&credit.key, credit.seconds, now)?;
        tracing::debug!(key = %credit.key, seconds = credit.seconds, total, "credited");
    }
    Ok(credit)
}
