//! Buffer counters.
//!
//! Plain relaxed atomics; read them through `MetricsSnapshot` and wire them to
//! whatever telemetry the host uses.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Counter {
    EventsPersisted,
    EventsDropped,
    SpansPersisted,
    SpansDropped,
    Prunes,
    RecordsPruned,
    ContextsSwept,
    StoreFailures,
}

#[derive(Debug, Default)]
pub struct BufferMetrics {
    events_persisted: AtomicU64,
    events_dropped: AtomicU64,
    spans_persisted: AtomicU64,
    spans_dropped: AtomicU64,
    prunes: AtomicU64,
    records_pruned: AtomicU64,
    contexts_swept: AtomicU64,
    store_failures: AtomicU64,
}

impl BufferMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, counter: Counter, n: u64) {
        if n == 0 {
            return;
        }
        self.slot(counter).fetch_add(n, Ordering::Relaxed);
        #[cfg(feature = "tracing")]
        tracing::trace!(?counter, n, "buffer metric");
    }

    pub(crate) fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::EventsPersisted => &self.events_persisted,
            Counter::EventsDropped => &self.events_dropped,
            Counter::SpansPersisted => &self.spans_persisted,
            Counter::SpansDropped => &self.spans_dropped,
            Counter::Prunes => &self.prunes,
            Counter::RecordsPruned => &self.records_pruned,
            Counter::ContextsSwept => &self.contexts_swept,
            Counter::StoreFailures => &self.store_failures,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c| self.slot(c).load(Ordering::Relaxed);
        MetricsSnapshot {
            events_persisted: get(Counter::EventsPersisted),
            events_dropped: get(Counter::EventsDropped),
            spans_persisted: get(Counter::SpansPersisted),
            spans_dropped: get(Counter::SpansDropped),
            prunes: get(Counter::Prunes),
            records_pruned: get(Counter::RecordsPruned),
            contexts_swept: get(Counter::ContextsSwept),
            store_failures: get(Counter::StoreFailures),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub events_persisted: u64,
    pub events_dropped: u64,
    pub spans_persisted: u64,
    pub spans_dropped: u64,
    pub prunes: u64,
    pub records_pruned: u64,
    pub contexts_swept: u64,
    pub store_failures: u64,
}
