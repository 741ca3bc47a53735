//! The read path: reconstruct the trailing window of one context.

use crashbuf_core::{ContextId, Snapshot};

use crate::guarded::GuardedStore;

/// Events start at the latest full snapshot at or before `now - window_ms`
/// (or at the window edge when there is none) and are cut to begin at a full
/// snapshot. Spans are limited to the window and to the first returned event.
pub(crate) fn read_window(
    store: &GuardedStore,
    ctx: &ContextId,
    window_ms: u64,
    now: u64,
) -> Snapshot {
    let from_ts = now.saturating_sub(window_ms);
    let query_from = store
        .last_full_snapshot_at_or_before(ctx, from_ts)
        .map_or(from_ts, |anchor| anchor.ts);

    let mut events = store.range_events(ctx, query_from, now);
    events.sort_by_key(|e| e.ts);
    let events = match events.iter().position(|e| e.is_full_snapshot) {
        Some(first_full) => events.split_off(first_full),
        None => Vec::new(),
    };

    let replay_start = events.first().map_or(from_ts, |e| e.ts);
    let mut spans = store.range_spans(ctx, from_ts, now);
    spans.retain(|s| s.ts >= replay_start);
    spans.sort_by_key(|s| s.ts);

    Snapshot {
        events,
        spans,
        attrs: store.get_attrs(ctx),
        window_ms,
        from_ts: replay_start,
        to_ts: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::BufferMetrics;
    use crashbuf_core::{EventRecord, SpanRecord, SpanStatus};
    use crashbuf_store::{BufferStore, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> (MemoryStore, GuardedStore, ContextId) {
        let mem = MemoryStore::new();
        let guarded = GuardedStore::new(Arc::new(mem.clone()), Arc::new(BufferMetrics::new()));
        (mem, guarded, ContextId::new("c"))
    }

    fn ev(ctx: &ContextId, ts: u64, full: bool) -> EventRecord {
        EventRecord {
            context_id: ctx.clone(),
            ts,
            is_full_snapshot: full,
            payload: json!({ "ts": ts }),
        }
    }

    fn span(ctx: &ContextId, ts: u64) -> SpanRecord {
        SpanRecord {
            context_id: ctx.clone(),
            ts,
            status: SpanStatus::Ok,
            span: json!({}),
        }
    }

    #[test]
    fn leading_incrementals_are_cut() {
        let (mem, store, ctx) = setup();
        for (ts, full) in [(950, false), (960, false), (970, true), (990, false)] {
            mem.append_event(&ev(&ctx, ts, full)).unwrap();
        }
        mem.append_spans(&[span(&ctx, 955), span(&ctx, 980)]).unwrap();

        let snap = read_window(&store, &ctx, 100, 1_000);
        let ts: Vec<u64> = snap.events.iter().map(|e| e.ts).collect();
        assert_eq!(ts, vec![970, 990]);
        assert_eq!(snap.from_ts, 970);
        assert_eq!(snap.spans.len(), 1);
        assert_eq!(snap.spans[0].ts, 980);
    }

    #[test]
    fn no_full_snapshot_means_no_events() {
        let (mem, store, ctx) = setup();
        mem.append_event(&ev(&ctx, 950, false)).unwrap();
        mem.append_spans(&[span(&ctx, 960)]).unwrap();

        let snap = read_window(&store, &ctx, 100, 1_000);
        assert!(snap.events.is_empty());
        assert_eq!(snap.from_ts, 900);
        assert_eq!(snap.to_ts, 1_000);
        assert_eq!(snap.spans.len(), 1);
    }

    #[test]
    fn window_larger_than_now_saturates() {
        let (_mem, store, ctx) = setup();
        let snap = read_window(&store, &ctx, 60_000, 10);
        assert_eq!(snap.from_ts, 0);
        assert_eq!(snap.to_ts, 10);
        assert!(snap.attrs.is_none());
    }
}
