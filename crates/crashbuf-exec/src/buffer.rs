//! `CrashBuffer`: the producer-facing API.
//!
//! Decisions (drop, persist, collapse, prune scheduling) are taken under the
//! context's state lock while the resulting operation is enqueued, so queue
//! order always equals decision order. Store work happens on the context's
//! worker; only `snapshot`, `flush` and `sweep_stale_contexts` wait for it.
//!
//! A context lives in the registry from its first write until a clear leaves
//! it idle; after that the next call starts it afresh.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crashbuf_core::{
    AttrsUpdate, BufferConfig, Clock, ContextId, EventPayload, Snapshot, SpanPayload, SystemClock,
};
use crashbuf_store::{build_store_from_config, BufferStore};

use crate::context::{ContextState, EventDecision, Phase};
use crate::error::{BufferError, BufferResult};
use crate::events::{BufferEvent, BufferEventKind, Emitter, SubscriptionId};
use crate::guarded::GuardedStore;
use crate::metrics::{BufferMetrics, Counter, MetricsSnapshot};
use crate::retention::{stale_contexts, RetentionPolicy};
use crate::snapshot::read_window;
use crate::worker::{ContextHandle, Op, Registry, Worker};

/// Send while holding the state lock. A closed queue only happens when the
/// runtime is shutting down; the operation is dropped.
fn enqueue(state: &mut ContextState, tx: &mpsc::UnboundedSender<Op>, op: Op) {
    state.ops_issued += 1;
    if tx.send(op).is_err() {
        #[cfg(feature = "tracing")]
        tracing::debug!("context queue closed; operation dropped");
    }
}

struct Inner {
    store: Arc<GuardedStore>,
    clock: Arc<dyn Clock>,
    config: BufferConfig,
    policy: RetentionPolicy,
    runtime: Handle,
    contexts: Arc<Registry>,
    emitter: Emitter,
    metrics: Arc<BufferMetrics>,
}

/// Rolling-window buffer of replay events and spans, one timeline per context.
///
/// Cheap to clone; clones share contexts, queues and subscribers.
#[derive(Clone)]
pub struct CrashBuffer {
    inner: Arc<Inner>,
}

impl CrashBuffer {
    /// Must be called from within a Tokio runtime.
    pub fn new(store: Arc<dyn BufferStore>, config: BufferConfig) -> BufferResult<Self> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn BufferStore>,
        config: BufferConfig,
        clock: Arc<dyn Clock>,
    ) -> BufferResult<Self> {
        let metrics = Arc::new(BufferMetrics::new());
        let store = GuardedStore::new(store, metrics.clone());
        Self::assemble(store, metrics, config, clock)
    }

    /// Build the store named by `config`. A store that cannot be opened yields
    /// a buffer that accepts every call and persists nothing.
    pub fn from_config(config: BufferConfig) -> BufferResult<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock))
    }

    pub fn from_config_with_clock(
        config: BufferConfig,
        clock: Arc<dyn Clock>,
    ) -> BufferResult<Self> {
        let metrics = Arc::new(BufferMetrics::new());
        let store = match build_store_from_config(&config.store_config()) {
            Ok(store) => GuardedStore::new(store, metrics.clone()),
            Err(e) => GuardedStore::unavailable(&e.to_string(), metrics.clone()),
        };
        Self::assemble(store, metrics, config, clock)
    }

    fn assemble(
        store: GuardedStore,
        metrics: Arc<BufferMetrics>,
        config: BufferConfig,
        clock: Arc<dyn Clock>,
    ) -> BufferResult<Self> {
        let runtime = Handle::try_current().map_err(|e| BufferError::Runtime(e.to_string()))?;
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                store: Arc::new(store),
                clock,
                policy: RetentionPolicy::from_config(&config),
                config,
                runtime,
                contexts: Arc::new(Registry::new(HashMap::new())),
                emitter: Emitter::default(),
                metrics,
            }),
        })
    }

    pub fn config(&self) -> &BufferConfig {
        &self.inner.config
    }

    /// True once the store reported itself unavailable.
    pub fn is_degraded(&self) -> bool {
        self.inner.store.is_degraded()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Contexts with live state in this process.
    pub fn contexts(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self.registry().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<ContextId, ContextHandle>> {
        self.inner
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, ctx: &ContextId) -> ContextHandle {
        let mut registry = self.registry();
        if let Some(handle) = registry.get(ctx) {
            return handle.clone();
        }
        let state = Arc::new(Mutex::new(ContextState::default()));
        let tx = Worker {
            ctx: ctx.clone(),
            store: self.inner.store.clone(),
            state: state.clone(),
            metrics: self.inner.metrics.clone(),
            registry: Arc::downgrade(&self.inner.contexts),
        }
        .spawn(&self.inner.runtime);
        let handle = ContextHandle { state, tx };
        registry.insert(ctx.clone(), handle.clone());
        #[cfg(feature = "tracing")]
        tracing::debug!(context = %ctx, "context created");
        handle
    }

    fn existing(&self, ctx: &ContextId) -> Option<ContextHandle> {
        self.registry().get(ctx).cloned()
    }

    /// Run `f` under the state lock of the context's live handle. A handle
    /// retired between lookup and lock is skipped for a fresh one.
    fn with_state<R>(
        &self,
        ctx: &ContextId,
        f: impl FnOnce(&ContextHandle, &mut ContextState) -> R,
    ) -> R {
        loop {
            let handle = self.handle(ctx);
            let mut state = handle.lock();
            if !state.retired {
                return f(&handle, &mut state);
            }
        }
    }

    /// Accept one replay event. Dropped while inactive, and incrementals are
    /// dropped until a full snapshot anchors the context.
    pub fn append_event(&self, ctx: &ContextId, payload: EventPayload, window_ms: u64) {
        self.with_state(ctx, |handle, state| {
            match state.decide_event(payload.ts, payload.is_full_snapshot) {
                EventDecision::DropInactive | EventDecision::DropNoAnchor => {
                    self.inner.metrics.incr(Counter::EventsDropped);
                }
                EventDecision::Persist { collapse } => {
                    let record = payload.into_record(ctx.clone());
                    enqueue(state, &handle.tx, Op::PersistEvent { record, collapse });
                    self.prune_soon(state, &handle.tx, window_ms);
                }
            }
        });
    }

    /// Accept a batch of completed spans; all or nothing.
    ///
    /// Emits `ErrorSpanAppended` for the first error-status span of the batch.
    pub fn append_spans(&self, ctx: &ContextId, payloads: Vec<SpanPayload>, window_ms: u64) {
        if payloads.is_empty() {
            return;
        }
        let first_error = self.with_state(ctx, |handle, state| {
            for p in &payloads {
                state.observe(p.ts);
            }
            if !state.is_active {
                self.inner
                    .metrics
                    .add(Counter::SpansDropped, payloads.len() as u64);
                return None;
            }
            let first_error = payloads
                .iter()
                .find(|p| p.status.is_error())
                .map(|p| (p.ts, p.raw.clone()));
            let records = payloads
                .into_iter()
                .map(|p| p.into_record(ctx.clone()))
                .collect();
            enqueue(state, &handle.tx, Op::PersistSpans(records));
            self.prune_soon(state, &handle.tx, window_ms);
            first_error
        });

        // Outside the state lock: handlers may call back into the buffer.
        if let Some((ts, span)) = first_error {
            self.inner.emitter.emit(&BufferEvent::ErrorSpanAppended {
                context_id: ctx.clone(),
                ts,
                span,
            });
        }
    }

    /// Overwrite the context's attributes; `updated_at` is now.
    pub fn set_attrs(&self, ctx: &ContextId, update: AttrsUpdate) {
        let now = self.inner.clock.now_ms();
        let record = update.into_record(ctx.clone(), now);
        self.with_state(ctx, |handle, state| {
            // Counts as a heartbeat.
            state.last_touch_at = Some(now);
            enqueue(state, &handle.tx, Op::SetAttrs(record));
        });
    }

    fn prune_soon(&self, state: &mut ContextState, tx: &mpsc::UnboundedSender<Op>, window_ms: u64) {
        let now = self.inner.clock.now_ms();
        if state.take_touch(&self.inner.policy, now) {
            enqueue(state, tx, Op::Touch(now));
        }
        if let Some(cutoff_ts) = state.take_prune(&self.inner.policy, window_ms, now) {
            enqueue(
                state,
                tx,
                Op::Prune {
                    cutoff_ts,
                    throttled: true,
                },
            );
        }
    }

    /// Replayable reconstruction of the trailing `window_ms` ending at `now`.
    ///
    /// Runs after every operation already issued for the context. Store
    /// failures shrink the result; they never fail the call. Reading a
    /// context this process has not written to does not register it.
    pub async fn snapshot(&self, ctx: &ContextId, window_ms: u64, now: u64) -> Snapshot {
        let empty = || Snapshot::empty(window_ms, now.saturating_sub(window_ms), now);
        let Some(handle) = self.existing(ctx) else {
            // Nothing is queued for an unregistered context.
            let store = self.inner.store.clone();
            let ctx = ctx.clone();
            return tokio::task::spawn_blocking(move || read_window(&store, &ctx, window_ms, now))
                .await
                .unwrap_or_else(|_| empty());
        };
        let (reply, rx) = oneshot::channel();
        {
            let mut state = handle.lock();
            enqueue(
                &mut state,
                &handle.tx,
                Op::Snapshot {
                    window_ms,
                    now,
                    reply,
                },
            );
        }
        rx.await.unwrap_or_else(|_| empty())
    }

    /// Wipe events, spans and attrs. The next accepted event must be a full
    /// snapshot.
    ///
    /// An active context is forgotten once the clear has run and nothing else
    /// was issued to it; a frozen one stays registered so it stays frozen.
    pub fn clear(&self, ctx: &ContextId) {
        self.issue_clear(ctx, false);
    }

    fn issue_clear(&self, ctx: &ContextId, forget: bool) -> ContextHandle {
        self.with_state(ctx, |handle, state| {
            state.reset();
            enqueue(state, &handle.tx, Op::Clear { forget });
            handle.clone()
        })
    }

    /// Freeze or resume a context; a no-op when `active` is unchanged.
    ///
    /// Freezing pins the retained window at the last seen event and prunes to
    /// it right away. Resuming from a freeze requires a new full snapshot.
    pub fn set_active(&self, ctx: &ContextId, active: bool, window_ms: u64) {
        let now = self.inner.clock.now_ms();
        self.with_state(ctx, |handle, state| {
            if active {
                if state.resume() {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(context = %ctx, "context resumed");
                }
                return;
            }
            if let Some(freeze_at) = state.freeze(now) {
                #[cfg(feature = "tracing")]
                tracing::debug!(context = %ctx, freeze_at, "context frozen");
                enqueue(
                    state,
                    &handle.tx,
                    Op::Prune {
                        cutoff_ts: freeze_at.saturating_sub(window_ms),
                        throttled: false,
                    },
                );
            }
        });
    }

    /// True for unknown contexts and whenever incrementals would be dropped.
    pub fn needs_full_snapshot(&self, ctx: &ContextId) -> bool {
        self.existing(ctx)
            .map_or(true, |h| h.lock().requires_full_snapshot)
    }

    pub fn phase(&self, ctx: &ContextId) -> Phase {
        self.existing(ctx)
            .map_or(Phase::AwaitingAnchor, |h| h.lock().phase())
    }

    pub fn is_active(&self, ctx: &ContextId) -> bool {
        self.existing(ctx).map_or(true, |h| h.lock().is_active)
    }

    pub fn on<F>(&self, kind: BufferEventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&BufferEvent) + Send + Sync + 'static,
    {
        self.inner.emitter.on(kind, handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.emitter.off(id)
    }

    /// Wait until every operation issued so far for `ctx` has run.
    pub async fn flush(&self, ctx: &ContextId) {
        if let Some(handle) = self.existing(ctx) {
            Self::flush_handle(&handle).await;
        }
    }

    pub async fn flush_all(&self) {
        let handles: Vec<ContextHandle> = self.registry().values().cloned().collect();
        for handle in &handles {
            Self::flush_handle(handle).await;
        }
    }

    async fn flush_handle(handle: &ContextHandle) {
        let (reply, rx) = oneshot::channel();
        {
            let mut state = handle.lock();
            enqueue(&mut state, &handle.tx, Op::Flush(reply));
        }
        let _ = rx.await;
    }

    /// Clear every context whose heartbeat is older than `max_age_ms`.
    ///
    /// Each clear goes through the context's own queue. A swept context is
    /// forgotten, frozen or not, unless something was issued to it while it
    /// was being cleared.
    pub async fn sweep_stale_contexts(&self, max_age_ms: u64, now: u64) -> usize {
        let policy = RetentionPolicy {
            stale_context_max_age_ms: max_age_ms,
            ..self.inner.policy
        };
        let stale = stale_contexts(&policy, &self.inner.store.list_attrs(), now);

        for ctx in &stale {
            let handle = self.issue_clear(ctx, true);
            Self::flush_handle(&handle).await;
        }

        self.inner
            .metrics
            .add(Counter::ContextsSwept, stale.len() as u64);
        #[cfg(feature = "tracing")]
        {
            if !stale.is_empty() {
                tracing::info!(swept = stale.len(), max_age_ms, "swept stale contexts");
            }
        }
        stale.len()
    }

    /// Sweep with the configured `stale_context_max_age_ms` at the clock's now.
    pub async fn sweep(&self) -> usize {
        let now = self.inner.clock.now_ms();
        self.sweep_stale_contexts(self.inner.policy.stale_context_max_age_ms, now)
            .await
    }
}
