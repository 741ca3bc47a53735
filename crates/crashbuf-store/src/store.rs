//! Abstract persistent store for buffered records.

use crashbuf_core::{AttrsRecord, ContextId, EventRecord, RecordKind, SpanRecord};

use crate::error::StoreResult;

/// Persistent keyed store with range queries by `(context, ts)`.
///
/// Implemented by `MemoryStore` and `LogStore`. All calls are synchronous and
/// short; the orchestrator serializes them per context on its own queue, so
/// implementations only need to be internally thread-safe.
pub trait BufferStore: Send + Sync {
    /// Insert one replay event. Never overwrites; equal timestamps are kept
    /// in insertion order.
    fn append_event(&self, record: &EventRecord) -> StoreResult<()>;

    /// Insert a batch of spans. A failed batch for one context leaves none
    /// of its spans behind.
    fn append_spans(&self, records: &[SpanRecord]) -> StoreResult<()>;

    /// Events with `from_ts <= ts <= to_ts`, ordered by ts.
    fn range_events(&self, ctx: &ContextId, from_ts: u64, to_ts: u64)
        -> StoreResult<Vec<EventRecord>>;

    /// Spans with `from_ts <= ts <= to_ts`, ordered by ts.
    fn range_spans(&self, ctx: &ContextId, from_ts: u64, to_ts: u64)
        -> StoreResult<Vec<SpanRecord>>;

    /// Most recent full snapshot with `ts <= ts`.
    fn last_full_snapshot_at_or_before(
        &self,
        ctx: &ContextId,
        ts: u64,
    ) -> StoreResult<Option<EventRecord>>;

    /// Remove records of `kind` with `from_ts <= ts < to_ts`. Returns how many.
    fn delete_range(
        &self,
        ctx: &ContextId,
        kind: RecordKind,
        from_ts: u64,
        to_ts: u64,
    ) -> StoreResult<u64>;

    /// Remove every event, span and the attrs record of a context.
    fn delete_all(&self, ctx: &ContextId) -> StoreResult<()>;

    /// Overwrite the attrs record of `record.context_id`.
    fn set_attrs(&self, record: &AttrsRecord) -> StoreResult<()>;

    fn get_attrs(&self, ctx: &ContextId) -> StoreResult<Option<AttrsRecord>>;

    /// Attrs of every known context, used by the stale sweep.
    fn list_attrs(&self) -> StoreResult<Vec<AttrsRecord>>;

    /// Bump the heartbeat; creates an empty attrs record when none exists.
    fn touch(&self, ctx: &ContextId, ts: u64) -> StoreResult<()> {
        let record = match self.get_attrs(ctx)? {
            Some(mut attrs) => {
                attrs.updated_at = ts;
                attrs
            }
            None => AttrsRecord::empty(ctx.clone(), ts),
        };
        self.set_attrs(&record)
    }
}
