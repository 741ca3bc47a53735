//! Fallible store calls turned into "log once, continue".
//!
//! - `Unavailable`: degrade to no-op for the life of the buffer, warn once.
//! - `Write`: that record is lost; warn the first time, debug afterwards.
//! - `Read` / `Corrupt`: the call yields an empty result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crashbuf_core::{AttrsRecord, ContextId, EventRecord, RecordKind, SpanRecord};
use crashbuf_store::{BufferStore, StoreError, StoreResult};

use crate::metrics::{BufferMetrics, Counter};

pub struct GuardedStore {
    inner: Option<Arc<dyn BufferStore>>,
    degraded: AtomicBool,
    warned_write: AtomicBool,
    metrics: Arc<BufferMetrics>,
}

impl GuardedStore {
    pub fn new(inner: Arc<dyn BufferStore>, metrics: Arc<BufferMetrics>) -> Self {
        Self {
            inner: Some(inner),
            degraded: AtomicBool::new(false),
            warned_write: AtomicBool::new(false),
            metrics,
        }
    }

    /// A store that was never available; every call is a no-op.
    pub fn unavailable(reason: &str, metrics: Arc<BufferMetrics>) -> Self {
        let store = Self {
            inner: None,
            degraded: AtomicBool::new(false),
            warned_write: AtomicBool::new(false),
            metrics,
        };
        store.absorb::<()>(Err(StoreError::Unavailable(reason.to_string())));
        store
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Run `f` against the backend. `None` when degraded or when `f` failed.
    pub fn call<T>(&self, f: impl FnOnce(&dyn BufferStore) -> StoreResult<T>) -> Option<T> {
        if self.is_degraded() {
            return None;
        }
        let store = self.inner.as_deref()?;
        self.absorb(f(store))
    }

    fn absorb<T>(&self, result: StoreResult<T>) -> Option<T> {
        let err = match result {
            Ok(v) => return Some(v),
            Err(e) => e,
        };
        self.metrics.incr(Counter::StoreFailures);
        match &err {
            StoreError::Unavailable(_) => {
                if !self.degraded.swap(true, Ordering::AcqRel) {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %err, "crash buffer store unavailable; buffering disabled");
                    #[cfg(not(feature = "tracing"))]
                    eprintln!("crashbuf: {err}; buffering disabled");
                }
            }
            StoreError::Write(_) => {
                if !self.warned_write.swap(true, Ordering::AcqRel) {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %err, "crash buffer write dropped");
                } else {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(error = %err, "crash buffer write dropped");
                }
            }
            StoreError::Read(_) | StoreError::Corrupt(_) | StoreError::Config(_) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %err, "crash buffer read treated as empty");
            }
        }
        None
    }

    pub fn append_event(&self, record: &EventRecord) -> bool {
        self.call(|s| s.append_event(record)).is_some()
    }

    pub fn append_spans(&self, records: &[SpanRecord]) -> bool {
        self.call(|s| s.append_spans(records)).is_some()
    }

    pub fn range_events(&self, ctx: &ContextId, from_ts: u64, to_ts: u64) -> Vec<EventRecord> {
        self.call(|s| s.range_events(ctx, from_ts, to_ts))
            .unwrap_or_default()
    }

    pub fn range_spans(&self, ctx: &ContextId, from_ts: u64, to_ts: u64) -> Vec<SpanRecord> {
        self.call(|s| s.range_spans(ctx, from_ts, to_ts))
            .unwrap_or_default()
    }

    pub fn last_full_snapshot_at_or_before(&self, ctx: &ContextId, ts: u64) -> Option<EventRecord> {
        self.call(|s| s.last_full_snapshot_at_or_before(ctx, ts))
            .flatten()
    }

    pub fn delete_range(&self, ctx: &ContextId, kind: RecordKind, from_ts: u64, to_ts: u64) -> u64 {
        self.call(|s| s.delete_range(ctx, kind, from_ts, to_ts))
            .unwrap_or(0)
    }

    pub fn delete_all(&self, ctx: &ContextId) -> bool {
        self.call(|s| s.delete_all(ctx)).is_some()
    }

    pub fn set_attrs(&self, record: &AttrsRecord) -> bool {
        self.call(|s| s.set_attrs(record)).is_some()
    }

    pub fn get_attrs(&self, ctx: &ContextId) -> Option<AttrsRecord> {
        self.call(|s| s.get_attrs(ctx)).flatten()
    }

    pub fn list_attrs(&self) -> Vec<AttrsRecord> {
        self.call(|s| s.list_attrs()).unwrap_or_default()
    }

    pub fn touch(&self, ctx: &ContextId, ts: u64) -> bool {
        self.call(|s| s.touch(ctx, ts)).is_some()
    }
}
