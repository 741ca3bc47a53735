use std::sync::Arc;

use crashbuf::{
    BufferConfig, BufferStore, ContextId, CrashBuffer, EventPayload, ManualClock, MemoryStore,
    Phase, RecordKind, SpanPayload, SpanStatus,
};
use serde_json::json;

fn buffer_at(now: u64) -> (CrashBuffer, MemoryStore, ManualClock) {
    let clock = ManualClock::new(now);
    let mem = MemoryStore::new();
    let buf = CrashBuffer::with_clock(
        Arc::new(mem.clone()),
        BufferConfig::default(),
        Arc::new(clock.clone()),
    )
    .expect("buffer");
    (buf, mem, clock)
}

fn ts_of(snapshot: &crashbuf::Snapshot) -> Vec<u64> {
    snapshot.events.iter().map(|e| e.ts).collect()
}

#[tokio::test]
async fn scenario_a_full_then_incremental() {
    let (buf, _mem, _clock) = buffer_at(200);
    let ctx = ContextId::new("tab-a");

    buf.clear(&ctx);
    buf.append_event(&ctx, EventPayload::full(100, json!({"type": 2})), 1_000);
    buf.append_event(&ctx, EventPayload::incremental(150, json!({"type": 3})), 1_000);

    let snap = buf.snapshot(&ctx, 1_000, 200).await;
    assert_eq!(ts_of(&snap), vec![100, 150]);
    assert!(snap.events[0].is_full_snapshot);
    assert!(!snap.events[1].is_full_snapshot);
    assert_eq!(snap.from_ts, 100);
    assert_eq!(snap.to_ts, 200);
    assert_eq!(snap.window_ms, 1_000);
}

#[tokio::test]
async fn scenario_b_anchor_before_window_is_kept() {
    let (buf, _mem, _clock) = buffer_at(6_000);
    let ctx = ContextId::new("tab-b");

    buf.append_event(&ctx, EventPayload::full(100, json!(0)), 1_000);
    buf.append_event(&ctx, EventPayload::incremental(150, json!(1)), 1_000);
    buf.append_event(&ctx, EventPayload::incremental(5_000, json!(2)), 1_000);

    let snap = buf.snapshot(&ctx, 1_000, 6_000).await;
    assert_eq!(ts_of(&snap), vec![100, 150, 5_000]);
    assert_eq!(snap.from_ts, 100);
    assert_eq!(snap.to_ts, 6_000);
}

#[tokio::test]
async fn scenario_c_freeze_keeps_history_and_resume_needs_anchor() {
    let (buf, mem, clock) = buffer_at(1_000);
    let ctx = ContextId::new("tab-c");

    buf.append_event(&ctx, EventPayload::full(100, json!(0)), 500);
    buf.append_spans(&ctx, vec![SpanPayload::new(150, SpanStatus::Ok, json!({}))], 500);
    buf.append_event(&ctx, EventPayload::incremental(200, json!(1)), 500);
    buf.append_event(&ctx, EventPayload::full(350, json!(2)), 500);
    buf.append_event(&ctx, EventPayload::incremental(900, json!(3)), 500);

    // Freeze point is the last seen event (900); cutoff 400, anchor 350.
    buf.set_active(&ctx, false, 500);
    assert_eq!(buf.phase(&ctx), Phase::Frozen);
    buf.flush(&ctx).await;
    let stored: Vec<u64> = mem
        .range_events(&ctx, 0, u64::MAX)
        .unwrap()
        .iter()
        .map(|e| e.ts)
        .collect();
    assert_eq!(stored, vec![350, 900]);
    assert_eq!(mem.len(&ctx, RecordKind::Span), 0);

    clock.set(2_000);
    buf.set_active(&ctx, true, 500);
    assert!(buf.needs_full_snapshot(&ctx));
    assert_eq!(buf.phase(&ctx), Phase::AwaitingAnchor);

    buf.append_event(&ctx, EventPayload::incremental(2_100, json!(4)), 500);
    let snap = buf.snapshot(&ctx, 500, 2_000).await;
    assert_eq!(ts_of(&snap), vec![350, 900]);
}

#[tokio::test]
async fn toggling_active_without_anchor_needs_full_snapshot() {
    let (buf, _mem, _clock) = buffer_at(1_000);
    let ctx = ContextId::new("tab");

    buf.append_event(&ctx, EventPayload::full(900, json!(0)), 1_000);
    assert!(!buf.needs_full_snapshot(&ctx));
    buf.set_active(&ctx, false, 1_000);
    buf.set_active(&ctx, true, 1_000);
    assert!(buf.needs_full_snapshot(&ctx));

    // Unchanged activity is a no-op.
    buf.append_event(&ctx, EventPayload::full(950, json!(1)), 1_000);
    buf.set_active(&ctx, true, 1_000);
    assert!(!buf.needs_full_snapshot(&ctx));
}

#[tokio::test]
async fn incrementals_into_fresh_or_cleared_context_are_dropped() {
    let (buf, mem, _clock) = buffer_at(1_000);
    let ctx = ContextId::new("tab");

    assert!(buf.needs_full_snapshot(&ctx));
    buf.append_event(&ctx, EventPayload::incremental(10, json!(0)), 1_000);
    buf.flush(&ctx).await;
    assert_eq!(mem.len(&ctx, RecordKind::Event), 0);

    buf.append_event(&ctx, EventPayload::full(20, json!(1)), 1_000);
    buf.clear(&ctx);
    buf.append_event(&ctx, EventPayload::incremental(30, json!(2)), 1_000);
    buf.flush(&ctx).await;
    assert!(mem.is_empty(&ctx));
    assert_eq!(buf.metrics().events_dropped, 2);
}

#[tokio::test]
async fn contexts_do_not_interfere() {
    let (buf, _mem, _clock) = buffer_at(1_000);
    let a = ContextId::new("a");
    let b = ContextId::new("b");

    buf.append_event(&a, EventPayload::full(500, json!("a")), 1_000);
    buf.append_event(&b, EventPayload::full(600, json!("b")), 1_000);
    buf.clear(&a);

    assert!(buf.snapshot(&a, 1_000, 1_000).await.events.is_empty());
    assert_eq!(ts_of(&buf.snapshot(&b, 1_000, 1_000).await), vec![600]);
    assert!(buf.needs_full_snapshot(&a));
    assert!(!buf.needs_full_snapshot(&b));
}

#[tokio::test]
async fn attrs_are_overwritten_and_returned() {
    let (buf, _mem, clock) = buffer_at(1_000);
    let ctx = ContextId::new("tab");

    buf.set_attrs(
        &ctx,
        crashbuf::AttrsUpdate {
            session_attributes: Some(json!({"sid": 1})),
            ..Default::default()
        },
    );
    clock.set(1_500);
    buf.set_attrs(
        &ctx,
        crashbuf::AttrsUpdate {
            user_attributes: Some(json!({"uid": 7})),
            ..Default::default()
        },
    );

    let attrs = buf.snapshot(&ctx, 1_000, 1_500).await.attrs.expect("attrs");
    assert_eq!(attrs.updated_at, 1_500);
    assert!(attrs.session_attributes.is_none());
    assert_eq!(attrs.user_attributes, Some(json!({"uid": 7})));
}
