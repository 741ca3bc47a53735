//! In-memory indexed store.
//!
//! Each context owns two `BTreeMap`s keyed by `(ts, seq)`, which gives ordered
//! range scans and keeps records with equal timestamps apart. Used for the
//! `memory://` scheme and throughout the tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crashbuf_core::{AttrsRecord, ContextId, EventRecord, RecordKind, SpanRecord};

use crate::error::{StoreError, StoreResult};
use crate::store::BufferStore;

type Key = (u64, u64);

#[derive(Default)]
struct ContextTables {
    events: BTreeMap<Key, EventRecord>,
    spans: BTreeMap<Key, SpanRecord>,
    attrs: Option<AttrsRecord>,
}

#[derive(Default)]
struct Inner {
    contexts: HashMap<ContextId, ContextTables>,
    next_seq: u64,
}

impl Inner {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Thread-safe in-memory store; clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records of `kind` for a context.
    pub fn len(&self, ctx: &ContextId, kind: RecordKind) -> usize {
        let Ok(inner) = self.read() else { return 0 };
        inner.contexts.get(ctx).map_or(0, |t| match kind {
            RecordKind::Event => t.events.len(),
            RecordKind::Span => t.spans.len(),
        })
    }

    pub fn is_empty(&self, ctx: &ContextId) -> bool {
        let Ok(inner) = self.read() else { return true };
        inner
            .contexts
            .get(ctx)
            .map_or(true, |t| t.events.is_empty() && t.spans.is_empty() && t.attrs.is_none())
    }

    pub fn context_count(&self) -> usize {
        self.read().map_or(0, |inner| inner.contexts.len())
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| StoreError::Read("memory store lock poisoned".into()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Write("memory store lock poisoned".into()))
    }
}

fn inclusive<V: Clone>(map: &BTreeMap<Key, V>, from_ts: u64, to_ts: u64) -> Vec<V> {
    if from_ts > to_ts {
        return Vec::new();
    }
    map.range((from_ts, 0)..=(to_ts, u64::MAX))
        .map(|(_, v)| v.clone())
        .collect()
}

fn remove_half_open<V>(map: &mut BTreeMap<Key, V>, from_ts: u64, to_ts: u64) -> u64 {
    if from_ts >= to_ts {
        return 0;
    }
    let keys: Vec<Key> = map
        .range((from_ts, 0)..(to_ts, 0))
        .map(|(k, _)| *k)
        .collect();
    for k in &keys {
        map.remove(k);
    }
    keys.len() as u64
}

impl BufferStore for MemoryStore {
    fn append_event(&self, record: &EventRecord) -> StoreResult<()> {
        let mut inner = self.write()?;
        let seq = inner.seq();
        inner
            .contexts
            .entry(record.context_id.clone())
            .or_default()
            .events
            .insert((record.ts, seq), record.clone());
        Ok(())
    }

    fn append_spans(&self, records: &[SpanRecord]) -> StoreResult<()> {
        let mut inner = self.write()?;
        for record in records {
            let seq = inner.seq();
            inner
                .contexts
                .entry(record.context_id.clone())
                .or_default()
                .spans
                .insert((record.ts, seq), record.clone());
        }
        Ok(())
    }

    fn range_events(
        &self,
        ctx: &ContextId,
        from_ts: u64,
        to_ts: u64,
    ) -> StoreResult<Vec<EventRecord>> {
        let inner = self.read()?;
        Ok(inner
            .contexts
            .get(ctx)
            .map(|t| inclusive(&t.events, from_ts, to_ts))
            .unwrap_or_default())
    }

    fn range_spans(
        &self,
        ctx: &ContextId,
        from_ts: u64,
        to_ts: u64,
    ) -> StoreResult<Vec<SpanRecord>> {
        let inner = self.read()?;
        Ok(inner
            .contexts
            .get(ctx)
            .map(|t| inclusive(&t.spans, from_ts, to_ts))
            .unwrap_or_default())
    }

    fn last_full_snapshot_at_or_before(
        &self,
        ctx: &ContextId,
        ts: u64,
    ) -> StoreResult<Option<EventRecord>> {
        let inner = self.read()?;
        Ok(inner.contexts.get(ctx).and_then(|t| {
            t.events
                .range(..=(ts, u64::MAX))
                .rev()
                .map(|(_, e)| e)
                .find(|e| e.is_full_snapshot)
                .cloned()
        }))
    }

    fn delete_range(
        &self,
        ctx: &ContextId,
        kind: RecordKind,
        from_ts: u64,
        to_ts: u64,
    ) -> StoreResult<u64> {
        let mut inner = self.write()?;
        let Some(tables) = inner.contexts.get_mut(ctx) else {
            return Ok(0);
        };
        Ok(match kind {
            RecordKind::Event => remove_half_open(&mut tables.events, from_ts, to_ts),
            RecordKind::Span => remove_half_open(&mut tables.spans, from_ts, to_ts),
        })
    }

    fn delete_all(&self, ctx: &ContextId) -> StoreResult<()> {
        let mut inner = self.write()?;
        inner.contexts.remove(ctx);
        Ok(())
    }

    fn set_attrs(&self, record: &AttrsRecord) -> StoreResult<()> {
        let mut inner = self.write()?;
        inner
            .contexts
            .entry(record.context_id.clone())
            .or_default()
            .attrs = Some(record.clone());
        Ok(())
    }

    fn get_attrs(&self, ctx: &ContextId) -> StoreResult<Option<AttrsRecord>> {
        let inner = self.read()?;
        Ok(inner.contexts.get(ctx).and_then(|t| t.attrs.clone()))
    }

    fn list_attrs(&self) -> StoreResult<Vec<AttrsRecord>> {
        let inner = self.read()?;
        let mut out: Vec<AttrsRecord> = inner
            .contexts
            .values()
            .filter_map(|t| t.attrs.clone())
            .collect();
        out.sort_by(|a, b| a.context_id.cmp(&b.context_id));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

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
            status: Default::default(),
            span: json!({}),
        }
    }

    #[test]
    fn range_is_inclusive_and_ordered() {
        let store = MemoryStore::new();
        let ctx = ContextId::new("a");
        for ts in [300, 100, 200] {
            store.append_event(&ev(&ctx, ts, false)).unwrap();
        }
        let got: Vec<u64> = store
            .range_events(&ctx, 100, 200)
            .unwrap()
            .iter()
            .map(|e| e.ts)
            .collect();
        assert_eq!(got, vec![100, 200]);
    }

    #[test]
    fn equal_timestamps_are_not_overwritten() {
        let store = MemoryStore::new();
        let ctx = ContextId::new("a");
        store.append_event(&ev(&ctx, 10, true)).unwrap();
        store.append_event(&ev(&ctx, 10, false)).unwrap();
        let got = store.range_events(&ctx, 0, 10).unwrap();
        assert_eq!(got.len(), 2);
        assert!(got[0].is_full_snapshot);
    }

    #[test]
    fn last_full_snapshot_lookup() {
        let store = MemoryStore::new();
        let ctx = ContextId::new("a");
        store.append_event(&ev(&ctx, 100, true)).unwrap();
        store.append_event(&ev(&ctx, 150, false)).unwrap();
        store.append_event(&ev(&ctx, 400, true)).unwrap();

        let at = |ts| {
            store
                .last_full_snapshot_at_or_before(&ctx, ts)
                .unwrap()
                .map(|e| e.ts)
        };
        assert_eq!(at(99), None);
        assert_eq!(at(100), Some(100));
        assert_eq!(at(399), Some(100));
        assert_eq!(at(10_000), Some(400));
    }

    #[test]
    fn delete_range_is_half_open() {
        let store = MemoryStore::new();
        let ctx = ContextId::new("a");
        store
            .append_spans(&[span(&ctx, 1), span(&ctx, 2), span(&ctx, 3)])
            .unwrap();
        assert_eq!(store.delete_range(&ctx, RecordKind::Span, 0, 3).unwrap(), 2);
        assert_eq!(store.len(&ctx, RecordKind::Span), 1);
        assert_eq!(store.delete_range(&ctx, RecordKind::Span, 5, 1).unwrap(), 0);
    }

    #[test]
    fn contexts_are_isolated() {
        let store = MemoryStore::new();
        let a = ContextId::new("a");
        let b = ContextId::new("b");
        store.append_event(&ev(&a, 1, true)).unwrap();
        store.append_event(&ev(&b, 1, true)).unwrap();
        store.delete_all(&a).unwrap();
        assert!(store.is_empty(&a));
        assert_eq!(store.len(&b, RecordKind::Event), 1);
    }

    #[test]
    fn touch_creates_then_bumps_attrs() {
        let store = MemoryStore::new();
        let ctx = ContextId::new("a");
        store.touch(&ctx, 5).unwrap();
        assert_eq!(store.get_attrs(&ctx).unwrap().unwrap().updated_at, 5);

        let mut attrs = AttrsRecord::empty(ctx.clone(), 6);
        attrs.user_attributes = Some(json!({"id": 1}));
        store.set_attrs(&attrs).unwrap();
        store.touch(&ctx, 9).unwrap();

        let got = store.get_attrs(&ctx).unwrap().unwrap();
        assert_eq!(got.updated_at, 9);
        assert_eq!(got.user_attributes, Some(json!({"id": 1})));
        assert_eq!(store.list_attrs().unwrap().len(), 1);
    }
}
