//! Per-context state machine.
//!
//! `AwaitingAnchor -> Armed` on a full snapshot, `Armed -> Frozen` on
//! deactivation, `Frozen -> AwaitingAnchor` on reactivation, and any state
//! back to `AwaitingAnchor` on clear.

use serde::{Deserialize, Serialize};

use crate::retention::RetentionPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    AwaitingAnchor,
    Armed,
    Frozen,
}

/// What to do with an incoming replay event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventDecision {
    DropInactive,
    DropNoAnchor,
    /// `collapse`: first anchor since (re)arming; older history goes.
    Persist { collapse: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ContextState {
    pub is_active: bool,
    pub requires_full_snapshot: bool,
    pub last_seen_event_ts: u64,
    pub frozen_at_ts: Option<u64>,
    pub last_prune_at: Option<u64>,
    pub prune_in_flight: bool,
    pub last_touch_at: Option<u64>,
    /// Operations enqueued so far; lets the sweep tell whether a context was
    /// used again while it was being cleared.
    pub ops_issued: u64,
    /// Dropped from the registry; callers must fetch a fresh handle.
    pub retired: bool,
}

impl Default for ContextState {
    fn default() -> Self {
        Self {
            is_active: true,
            requires_full_snapshot: true,
            last_seen_event_ts: 0,
            frozen_at_ts: None,
            last_prune_at: None,
            prune_in_flight: false,
            last_touch_at: None,
            ops_issued: 0,
            retired: false,
        }
    }
}

impl ContextState {
    pub fn phase(&self) -> Phase {
        if self.requires_full_snapshot {
            Phase::AwaitingAnchor
        } else if !self.is_active {
            Phase::Frozen
        } else {
            Phase::Armed
        }
    }

    pub fn observe(&mut self, ts: u64) {
        self.last_seen_event_ts = self.last_seen_event_ts.max(ts);
    }

    pub fn decide_event(&mut self, ts: u64, is_full_snapshot: bool) -> EventDecision {
        self.observe(ts);
        if !self.is_active {
            return EventDecision::DropInactive;
        }
        if !is_full_snapshot {
            return if self.requires_full_snapshot {
                EventDecision::DropNoAnchor
            } else {
                EventDecision::Persist { collapse: false }
            };
        }
        let collapse = std::mem::replace(&mut self.requires_full_snapshot, false);
        EventDecision::Persist { collapse }
    }

    /// Returns the cutoff of a prune to run now, marking it in flight.
    pub fn take_prune(&mut self, policy: &RetentionPolicy, window_ms: u64, now: u64) -> Option<u64> {
        if self.prune_in_flight || !policy.prune_due(self.last_prune_at, now) {
            return None;
        }
        self.prune_in_flight = true;
        self.last_prune_at = Some(now);
        Some(RetentionPolicy::cutoff(self.frozen_at_ts, now, window_ms))
    }

    pub fn take_touch(&mut self, policy: &RetentionPolicy, now: u64) -> bool {
        if !policy.touch_due(self.last_touch_at, now) {
            return false;
        }
        self.last_touch_at = Some(now);
        true
    }

    /// Deactivate. Returns the freeze point when the state changed.
    pub fn freeze(&mut self, now: u64) -> Option<u64> {
        if !self.is_active {
            return None;
        }
        self.is_active = false;
        let freeze_at = if self.last_seen_event_ts > 0 {
            self.last_seen_event_ts
        } else {
            now
        };
        self.frozen_at_ts = Some(freeze_at);
        Some(freeze_at)
    }

    /// Reactivate. Returns false when already active.
    pub fn resume(&mut self) -> bool {
        if self.is_active {
            return false;
        }
        self.is_active = true;
        if self.frozen_at_ts.take().is_some() {
            self.requires_full_snapshot = true;
        }
        self.last_prune_at = None;
        true
    }

    /// State after `clear`; activity, freeze point and the prune throttle are
    /// kept. The heartbeat went with the attrs, so the next append re-creates it.
    pub fn reset(&mut self) {
        self.requires_full_snapshot = true;
        self.last_seen_event_ts = 0;
        self.last_touch_at = None;
    }

    /// Nothing here that a fresh context would not also have.
    pub fn forgettable(&self) -> bool {
        self.is_active && self.requires_full_snapshot && self.frozen_at_ts.is_none()
    }
}
