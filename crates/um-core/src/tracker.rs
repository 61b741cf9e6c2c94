//! Activity tracking: which key owns elapsed wall-clock time.
//!
//! The tracker is a pure state machine. Every operation takes the current
//! time explicitly and hands back the [`Credit`] that must be made durable;
//! it never touches storage itself.
//!
//! # Accounting boundary
//!
//! `boundary` is the instant up to which elapsed time has been credited.
//! Ticks and focus/idle transitions all go through the same step: compute
//! whole seconds since the boundary, credit them to the focused key (unless
//! idle), move the boundary to `now`. Whichever trigger runs first consumes
//! the interval, so overlapping triggers cannot credit it twice. Ticks move
//! the boundary only by the seconds they credit, so a regular tick does not
//! shed a fraction of a second every period.

use chrono::{DateTime, TimeDelta, Utc};

use crate::types::TrackingKey;

/// Elapsed whole seconds owed to a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credit {
    pub key: TrackingKey,
    pub seconds: u64,
}

/// Process-wide accounting state.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    focused: Option<TrackingKey>,
    boundary: DateTime<Utc>,
    idle: bool,
}

impl ActivityTracker {
    /// Creates a tracker with nothing focused, not idle, boundary at `now`.
    #[must_use]
    pub const fn new(now: DateTime<Utc>) -> Self {
        Self {
            focused: None,
            boundary: now,
            idle: false,
        }
    }

    /// The key currently owning elapsed time, if any.
    #[must_use]
    pub const fn focused(&self) -> Option<&TrackingKey> {
        self.focused.as_ref()
    }

    /// The instant up to which time has been credited.
    #[must_use]
    pub const fn boundary(&self) -> DateTime<Utc> {
        self.boundary
    }

    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.idle
    }

    /// The credit owed for the interval `[boundary, now)`, without consuming it.
    ///
    /// Returns `None` when idle, when nothing trackable is focused, or when
    /// less than one whole second has elapsed. A clock that moved backwards
    /// counts as zero elapsed time.
    #[must_use]
    pub fn pending(&self, now: DateTime<Utc>) -> Option<Credit> {
        if self.idle {
            return None;
        }
        let key = self.focused.as_ref()?;
        let seconds = u64::try_from((now - self.boundary).num_seconds()).unwrap_or(0);
        if seconds == 0 {
            return None;
        }
        Some(Credit {
            key: key.clone(),
            seconds,
        })
    }

    /// Moves the boundary to `now`, discarding whatever was pending.
    pub const fn advance(&mut self, now: DateTime<Utc>) {
        self.boundary = now;
    }

    /// Moves the boundary past the whole seconds [`pending`](Self::pending)
    /// reports at `now`, keeping the sub-second remainder for the next tick.
    ///
    /// When nothing is owed because the tracker is idle, nothing trackable is
    /// focused, or the clock moved backwards, the boundary jumps to `now`.
    pub fn advance_tick(&mut self, now: DateTime<Utc>) {
        let elapsed = now - self.boundary;
        if self.idle || self.focused.is_none() || elapsed < TimeDelta::zero() {
            self.boundary = now;
            return;
        }
        self.boundary += TimeDelta::seconds(elapsed.num_seconds());
    }

    /// Consumes the interval up to `now` and returns its credit.
    pub fn settle(&mut self, now: DateTime<Utc>) -> Option<Credit> {
        let credit = self.pending(now);
        self.advance(now);
        credit
    }

    /// Host reported a focus change.
    ///
    /// The previous key is credited up to `now` before ownership moves.
    /// Refocusing the same key is harmless: it settles and carries on.
    pub fn focus_changed(&mut self, key: Option<TrackingKey>, now: DateTime<Utc>) -> Option<Credit> {
        let credit = self.settle(now);
        self.focused = key;
        credit
    }

    /// Host reported an idle-state change.
    ///
    /// Entering idle settles the interval first. Leaving idle restarts the
    /// boundary without crediting. Repeats of the current state change nothing.
    pub fn idle_changed(&mut self, idle: bool, now: DateTime<Utc>) -> Option<Credit> {
        match (self.idle, idle) {
            (false, true) => {
                let credit = self.settle(now);
                self.idle = true;
                credit
            }
            (true, false) => {
                self.idle = false;
                self.advance(now);
                None
            }
            _ => None,
        }
    }
}
