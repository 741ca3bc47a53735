//! Throttled, anchor-preserving pruning and the stale-context sweep rules.

use serde::{Deserialize, Serialize};

use crashbuf_core::{AttrsRecord, BufferConfig, ContextId, RecordKind};
use crashbuf_store::{BufferStore, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub prune_interval_ms: u64,
    pub touch_interval_ms: u64,
    pub stale_context_max_age_ms: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from_config(&BufferConfig::default())
    }
}

impl RetentionPolicy {
    pub fn from_config(cfg: &BufferConfig) -> Self {
        Self {
            prune_interval_ms: cfg.prune_interval_ms,
            touch_interval_ms: cfg.touch_interval_ms,
            stale_context_max_age_ms: cfg.stale_context_max_age_ms,
        }
    }

    /// `None` (never pruned) is always due.
    pub fn prune_due(&self, last_prune_at: Option<u64>, now: u64) -> bool {
        last_prune_at.map_or(true, |at| now.saturating_sub(at) >= self.prune_interval_ms)
    }

    pub fn touch_due(&self, last_touch_at: Option<u64>, now: u64) -> bool {
        last_touch_at.map_or(true, |at| now.saturating_sub(at) > self.touch_interval_ms)
    }

    /// Sliding cutoff, or the fixed one while frozen.
    pub fn cutoff(frozen_at: Option<u64>, now: u64, window_ms: u64) -> u64 {
        frozen_at.unwrap_or(now).saturating_sub(window_ms)
    }

    pub fn is_stale(&self, attrs: &AttrsRecord, now: u64) -> bool {
        now.saturating_sub(attrs.updated_at) > self.stale_context_max_age_ms
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneOutcome {
    pub cutoff_ts: u64,
    pub event_cutoff_ts: u64,
    pub anchor_ts: Option<u64>,
    pub events_removed: u64,
    pub spans_removed: u64,
}

impl PruneOutcome {
    pub fn removed(&self) -> u64 {
        self.events_removed + self.spans_removed
    }
}

/// Delete everything before `cutoff_ts` except the anchor.
///
/// The anchor is the latest full snapshot at or before the cutoff; events from
/// `anchor.ts - 1` on survive. Spans get no exemption. A failed anchor lookup
/// aborts the pass so the anchor is never pruned by mistake.
pub fn prune_older_than_with_anchor(
    store: &dyn BufferStore,
    ctx: &ContextId,
    cutoff_ts: u64,
) -> StoreResult<PruneOutcome> {
    let anchor_ts = store
        .last_full_snapshot_at_or_before(ctx, cutoff_ts)?
        .map(|e| e.ts);
    let event_cutoff_ts = anchor_ts.map_or(cutoff_ts, |ts| ts.saturating_sub(1));

    let events_removed = store.delete_range(ctx, RecordKind::Event, 0, event_cutoff_ts)?;
    let spans_removed = store.delete_range(ctx, RecordKind::Span, 0, cutoff_ts)?;

    Ok(PruneOutcome {
        cutoff_ts,
        event_cutoff_ts,
        anchor_ts,
        events_removed,
        spans_removed,
    })
}

/// Contexts whose heartbeat is older than the policy's max age.
pub fn stale_contexts(policy: &RetentionPolicy, attrs: &[AttrsRecord], now: u64) -> Vec<ContextId> {
    attrs
        .iter()
        .filter(|a| policy.is_stale(a, now))
        .map(|a| a.context_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crashbuf_core::{EventRecord, SpanRecord};
    use crashbuf_store::MemoryStore;
    use serde_json::json;

    fn ev(ctx: &ContextId, ts: u64, full: bool) -> EventRecord {
        EventRecord {
            context_id: ctx.clone(),
            ts,
            is_full_snapshot: full,
            payload: json!({}),
        }
    }

    fn span(ctx: &ContextId, ts: u64) -> SpanRecord {
        SpanRecord {
            context_id: ctx.clone(),
            ts,
            status: Default::default(),
            span: json!({}),
        }
    }

    fn event_ts(store: &MemoryStore, ctx: &ContextId) -> Vec<u64> {
        store
            .range_events(ctx, 0, u64::MAX)
            .unwrap()
            .iter()
            .map(|e| e.ts)
            .collect()
    }

    #[test]
    fn keeps_anchor_and_one_ms_before_it() {
        let store = MemoryStore::new();
        let ctx = ContextId::new("c");
        for (ts, full) in [(10, true), (98, false), (99, false), (100, true), (150, false)] {
            store.append_event(&ev(&ctx, ts, full)).unwrap();
        }
        store.append_spans(&[span(&ctx, 99), span(&ctx, 120)]).unwrap();

        let out = prune_older_than_with_anchor(&store, &ctx, 120).unwrap();
        assert_eq!(out.anchor_ts, Some(100));
        assert_eq!(out.event_cutoff_ts, 99);
        // Event at 99 sits exactly on the exclusive cutoff and survives.
        assert_eq!(event_ts(&store, &ctx), vec![99, 100, 150]);
        assert_eq!(out.events_removed, 2);
        assert_eq!(out.spans_removed, 1);
    }

    #[test]
    fn without_anchor_cutoff_is_strict() {
        let store = MemoryStore::new();
        let ctx = ContextId::new("c");
        for ts in [50, 100, 101] {
            store.append_event(&ev(&ctx, ts, false)).unwrap();
        }
        let out = prune_older_than_with_anchor(&store, &ctx, 100).unwrap();
        assert_eq!(out.anchor_ts, None);
        assert_eq!(event_ts(&store, &ctx), vec![100, 101]);
    }

    #[test]
    fn prune_is_idempotent() {
        let store = MemoryStore::new();
        let ctx = ContextId::new("c");
        for (ts, full) in [(0, true), (40, false), (60, true), (70, false), (90, false)] {
            store.append_event(&ev(&ctx, ts, full)).unwrap();
        }
        store.append_spans(&[span(&ctx, 30), span(&ctx, 80)]).unwrap();

        prune_older_than_with_anchor(&store, &ctx, 75).unwrap();
        let events = event_ts(&store, &ctx);
        let spans = store.range_spans(&ctx, 0, u64::MAX).unwrap();

        let again = prune_older_than_with_anchor(&store, &ctx, 75).unwrap();
        assert_eq!(again.removed(), 0);
        assert_eq!(event_ts(&store, &ctx), events);
        assert_eq!(store.range_spans(&ctx, 0, u64::MAX).unwrap(), spans);
    }

    #[test]
    fn anchor_at_zero_saturates() {
        let store = MemoryStore::new();
        let ctx = ContextId::new("c");
        store.append_event(&ev(&ctx, 0, true)).unwrap();
        let out = prune_older_than_with_anchor(&store, &ctx, 1_000).unwrap();
        assert_eq!(out.event_cutoff_ts, 0);
        assert_eq!(event_ts(&store, &ctx), vec![0]);
    }

    #[test]
    fn throttle_and_touch_rules() {
        let policy = RetentionPolicy::default();
        assert!(policy.prune_due(None, 0));
        assert!(!policy.prune_due(Some(1_000), 2_999));
        assert!(policy.prune_due(Some(1_000), 3_000));
        assert!(policy.touch_due(None, 0));
        assert!(!policy.touch_due(Some(0), 30_000));
        assert!(policy.touch_due(Some(0), 30_001));
        assert_eq!(RetentionPolicy::cutoff(Some(1_000), 9_000, 500), 500);
        assert_eq!(RetentionPolicy::cutoff(None, 9_000, 500), 8_500);
        assert_eq!(RetentionPolicy::cutoff(None, 100, 500), 0);
    }

    #[test]
    fn stale_selection() {
        let policy = RetentionPolicy {
            stale_context_max_age_ms: 1_000,
            ..Default::default()
        };
        let attrs = vec![
            AttrsRecord::empty(ContextId::new("old"), 0),
            AttrsRecord::empty(ContextId::new("fresh"), 4_500),
            AttrsRecord::empty(ContextId::new("edge"), 4_000),
        ];
        assert_eq!(stale_contexts(&policy, &attrs, 5_000), vec![ContextId::new("old")]);
    }
}
