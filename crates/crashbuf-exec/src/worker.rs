//! Per-context operation queue.
//!
//! Every context owns one unbounded channel drained by one task, so store
//! operations for a context run in the order they were issued. Each operation
//! runs on the blocking pool; the next one starts only after it finished.
//!
//! After a clear, the worker drops its context from the registry as soon as
//! its queue is empty, so cleared contexts do not pin a task and a channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crashbuf_core::{AttrsRecord, ContextId, EventRecord, RecordKind, Snapshot, SpanRecord};

use crate::context::ContextState;
use crate::guarded::GuardedStore;
use crate::metrics::{BufferMetrics, Counter};
use crate::retention::prune_older_than_with_anchor;
use crate::snapshot::read_window;

pub(crate) type Registry = Mutex<HashMap<ContextId, ContextHandle>>;

#[derive(Clone)]
pub(crate) struct ContextHandle {
    pub state: Arc<Mutex<ContextState>>,
    pub tx: mpsc::UnboundedSender<Op>,
}

impl ContextHandle {
    pub(crate) fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) enum Op {
    PersistEvent { record: EventRecord, collapse: bool },
    PersistSpans(Vec<SpanRecord>),
    SetAttrs(AttrsRecord),
    Touch(u64),
    /// `throttled` prunes release the in-flight flag when done.
    Prune { cutoff_ts: u64, throttled: bool },
    /// `forget`: drop the context once idle even if it is frozen.
    Clear { forget: bool },
    Snapshot {
        window_ms: u64,
        now: u64,
        reply: oneshot::Sender<Snapshot>,
    },
    Flush(oneshot::Sender<()>),
}

pub(crate) struct Worker {
    pub ctx: ContextId,
    pub store: Arc<GuardedStore>,
    pub state: Arc<Mutex<ContextState>>,
    pub metrics: Arc<BufferMetrics>,
    pub registry: Weak<Registry>,
}

/// Where the worker stands with respect to the last clear.
#[derive(Clone, Copy)]
struct Progress {
    /// Operations received so far, including the current one.
    processed: u64,
    /// `Some(forget)` while nothing but reads followed a clear.
    retiring: Option<bool>,
}

impl Worker {
    pub(crate) fn spawn(self, runtime: &Handle) -> mpsc::UnboundedSender<Op> {
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(self.run(rx));
        tx
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<Op>) {
        let worker = Arc::new(self);
        let mut progress = Progress {
            processed: 0,
            retiring: None,
        };
        while let Some(op) = rx.recv().await {
            progress.processed += 1;
            progress.retiring = match &op {
                Op::Clear { forget } => Some(*forget),
                Op::Snapshot { .. } | Op::Flush(_) => progress.retiring,
                _ => None,
            };
            let w = worker.clone();
            if let Err(_e) = tokio::task::spawn_blocking(move || w.apply(op, progress)).await {
                #[cfg(feature = "tracing")]
                tracing::warn!(context = %worker.ctx, error = %_e, "buffer operation aborted");
            }
        }
        #[cfg(feature = "tracing")]
        tracing::trace!(context = %worker.ctx, "context queue closed");
    }

    fn apply(&self, op: Op, progress: Progress) {
        match op {
            Op::PersistEvent { record, collapse } => self.persist_event(record, collapse),
            Op::PersistSpans(records) => {
                let n = records.len() as u64;
                if self.store.append_spans(&records) {
                    self.metrics.add(Counter::SpansPersisted, n);
                } else {
                    self.metrics.add(Counter::SpansDropped, n);
                }
            }
            Op::SetAttrs(record) => {
                self.store.set_attrs(&record);
            }
            Op::Touch(ts) => {
                self.store.touch(&self.ctx, ts);
            }
            Op::Prune {
                cutoff_ts,
                throttled,
            } => {
                self.prune(cutoff_ts);
                if throttled {
                    self.lock_state().prune_in_flight = false;
                }
            }
            Op::Clear { .. } => {
                self.store.delete_all(&self.ctx);
                self.retire_if_idle(progress);
            }
            Op::Snapshot {
                window_ms,
                now,
                reply,
            } => {
                let snapshot = read_window(&self.store, &self.ctx, window_ms, now);
                self.retire_if_idle(progress);
                let _ = reply.send(snapshot);
            }
            Op::Flush(reply) => {
                self.retire_if_idle(progress);
                let _ = reply.send(());
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget a cleared context whose queue is empty. Registry before state,
    /// the same order `CrashBuffer` locks them in.
    fn retire_if_idle(&self, progress: Progress) {
        let Some(forget) = progress.retiring else {
            return;
        };
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
        if !registry
            .get(&self.ctx)
            .is_some_and(|h| Arc::ptr_eq(&h.state, &self.state))
        {
            return;
        }
        {
            let mut state = self.lock_state();
            if state.ops_issued != progress.processed || !(forget || state.forgettable()) {
                return;
            }
            state.retired = true;
        }
        registry.remove(&self.ctx);
        #[cfg(feature = "tracing")]
        tracing::debug!(context = %self.ctx, "context forgotten");
    }

    fn persist_event(&self, record: EventRecord, collapse: bool) {
        let ts = record.ts;
        if self.store.append_event(&record) {
            self.metrics.incr(Counter::EventsPersisted);
        } else {
            self.metrics.incr(Counter::EventsDropped);
        }
        if collapse {
            // History now starts at this snapshot.
            let removed = self.store.delete_range(&self.ctx, RecordKind::Event, 0, ts)
                + self.store.delete_range(&self.ctx, RecordKind::Span, 0, ts);
            self.metrics.add(Counter::RecordsPruned, removed);
            #[cfg(feature = "tracing")]
            tracing::debug!(context = %self.ctx, ts, removed, "collapsed history onto new anchor");
        }
    }

    fn prune(&self, cutoff_ts: u64) {
        let Some(outcome) = self
            .store
            .call(|s| prune_older_than_with_anchor(s, &self.ctx, cutoff_ts))
        else {
            return;
        };
        self.metrics.incr(Counter::Prunes);
        self.metrics.add(Counter::RecordsPruned, outcome.removed());
        #[cfg(feature = "tracing")]
        tracing::debug!(
            context = %self.ctx,
            cutoff_ts,
            anchor_ts = ?outcome.anchor_ts,
            events = outcome.events_removed,
            spans = outcome.spans_removed,
            "pruned"
        );
    }
}
